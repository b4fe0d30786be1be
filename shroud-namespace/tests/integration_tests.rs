use nix::errno::Errno;
use nix::mount::umount;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::{Pid, getegid, geteuid, getgid, getgroups, getpid, getuid};
use shroud_core::{ChildExit, Error};
use shroud_namespace::*;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

/// Run `check` in the isolated branch and report its verdict as the exit code
///
/// Returns `None` when isolation fails or no child was forked.
fn run_isolated(request: &IsolationRequest, check: impl FnOnce() -> bool) -> Option<ChildExit> {
    match isolate(request).ok()? {
        ExecutionResult::ForkedChild => {
            let code = i32::from(!check());
            std::process::exit(code);
        }
        ExecutionResult::ForkedParent {
            exit: Some(exit), ..
        } => Some(exit),
        ExecutionResult::ForkedParent { child, exit: None } => wait_for_child(child).ok(),
        ExecutionResult::Joined => None,
    }
}

fn isolate_and_check(request: &IsolationRequest, check: impl FnOnce() -> bool) -> ChildExit {
    run_isolated(request, check).expect("isolated child did not run")
}

/// Run `check` in a plain forked child
///
/// unshare(2) of user and mount namespaces fails in a multithreaded
/// process, and the test harness runs tests on threads.
fn in_forked_child(check: impl FnOnce() -> bool) -> ChildExit {
    let request = IsolationRequest::new().with_fork(true).with_wait(true);
    isolate_and_check(&request, check)
}

fn words(path: &str) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Whether the last mount of `/` carries a shared peer group
fn root_mount_is_shared() -> Option<bool> {
    let mountinfo = fs::read_to_string("/proc/self/mountinfo").ok()?;
    mountinfo
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|fields| fields.get(4) == Some(&"/"))
        .last()
        .map(|fields| {
            fields
                .iter()
                .skip(6)
                .take_while(|field| **field != "-")
                .any(|field| field.starts_with("shared:"))
        })
}

fn monotonic_seconds() -> libc::time_t {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid timespec
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut now) };
    now.tv_sec
}

#[test]
fn test_plan_is_side_effect_free() {
    let before = NamespaceInfo::current().unwrap();

    let request = IsolationRequest::new()
        .with_pid(true)
        .with_net(true)
        .with_join(NamespaceKind::Net, "/proc/self/ns/net")
        .with_fork(true);
    let err = Planner::plan(&request).unwrap_err();
    assert!(err.is_configuration());

    let after = NamespaceInfo::current().unwrap();
    assert!(before.differing(&after).is_empty());
}

#[test]
fn test_mount_proc_without_namespace_change_rejected() {
    let request = IsolationRequest::new()
        .with_uts(true)
        .with_ipc(true)
        .with_fork(true)
        .with_mount_proc("/proc");

    let err = isolate(&request).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[test]
fn test_plan_serializes_for_inspection() {
    let request = IsolationRequest::new()
        .with_pid(true)
        .with_fork(true)
        .with_mount_proc("/proc");
    let plan = Planner::plan(&request).unwrap();

    let json = serde_json::to_value(&plan).unwrap();
    let steps = json["steps"].as_array().unwrap();
    assert_eq!(steps[0]["step"], "create_namespaces");
    assert_eq!(steps[0]["namespaces"], serde_json::json!(["pid", "mount"]));
    assert_eq!(steps[1]["step"], "fork");
    assert_eq!(steps.last().unwrap()["path"], "/proc");
}

#[test]
fn test_unprivileged_create_fails_before_fork() {
    if geteuid().is_root() {
        return;
    }

    let request = IsolationRequest::new().with_net(true).with_fork(true);
    let mut executor = Executor::new(Planner::plan(&request).unwrap());

    let err = executor.execute().unwrap_err();
    assert!(matches!(err, Error::NamespaceCreate { .. }));
    assert_eq!(executor.state(), ExecutionState::Failed { step: 0 });
    assert_eq!(executor.role(), Role::Unforked);
}

#[test]
fn test_user_namespace_maps_caller_to_root() {
    let outer = geteuid().as_raw().to_string();
    let request = IsolationRequest::new()
        .with_map_root_user()
        .with_pid(true)
        .with_fork(true)
        .with_wait(true)
        .with_mount_proc("/proc");

    let exit = in_forked_child(move || match isolate(&request) {
        Ok(ExecutionResult::ForkedChild) => {
            let proc_self = fs::read_link("/proc/self").unwrap_or_default();
            let ok = geteuid().is_root()
                && getpid().as_raw() == 1
                && proc_self == Path::new("1")
                && words("/proc/self/uid_map") == ["0", outer.as_str(), "1"];
            std::process::exit(i32::from(!ok));
        }
        Ok(ExecutionResult::ForkedParent {
            exit: Some(exit), ..
        }) => exit.success(),
        // Unprivileged user namespaces are disabled on this host
        Err(Error::NamespaceCreate { .. }) => true,
        _ => false,
    });

    assert_eq!(exit, ChildExit::Exited(0));
}

#[test]
fn test_kill_child_when_parent_exits() {
    let (mut reader, writer) = std::io::pipe().unwrap();
    let request = IsolationRequest::new().with_kill_child(Signal::SIGKILL as i32);

    let exit = in_forked_child(move || {
        let mut writer = writer;
        match isolate(&request) {
            Ok(ExecutionResult::ForkedChild) => {
                std::thread::sleep(Duration::from_secs(5));
                let _ = writer.write_all(b"alive");
                std::process::exit(0);
            }
            // Returning ends this process, which must take the child along
            Ok(ExecutionResult::ForkedParent { .. }) => true,
            _ => false,
        }
    });
    assert!(exit.success());

    let mut output = Vec::new();
    reader.read_to_end(&mut output).unwrap();
    assert!(output.is_empty(), "child outlived its parent");
}

#[test]
#[ignore] // Requires root
fn test_without_fork_caller_changes_namespaces() {
    let exit = in_forked_child(|| {
        let Ok(before) = NamespaceInfo::current() else {
            return false;
        };

        let request = IsolationRequest::new().with_uts(true).with_ipc(true);
        let joined = matches!(isolate(&request), Ok(ExecutionResult::Joined));

        let Ok(after) = NamespaceInfo::current() else {
            return false;
        };
        let expected = NamespaceSet::only(NamespaceKind::Uts) | NamespaceKind::Ipc;
        let no_children = matches!(
            waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD)
        );

        joined && after.differing(&before) == expected && no_children
    });

    assert!(exit.success());
}

#[test]
#[ignore] // Requires root
fn test_child_is_pid_one_with_fresh_proc() {
    let request = IsolationRequest::new()
        .with_pid(true)
        .with_fork(true)
        .with_wait(true)
        .with_mount_proc("/proc");

    let exit = in_forked_child(move || {
        run_isolated(&request, || {
            let own = fs::read_link("/proc/self")
                .map(|link| link.to_string_lossy().into_owned())
                .unwrap_or_default();
            own == "1" && getpid().as_raw() == 1
        })
        .is_some_and(|exit| exit.success())
    });

    assert_eq!(exit, ChildExit::Exited(0));
}

#[test]
#[ignore] // Requires root
fn test_parent_keeps_pid_namespace() {
    let request = IsolationRequest::new()
        .with_pid(true)
        .with_uts(true)
        .with_fork(true)
        .with_wait(true)
        .with_hostname("shroud-test");

    let exit = in_forked_child(move || {
        let Ok(before) = NamespaceInfo::current() else {
            return false;
        };
        let renamed = run_isolated(&request, || {
            nix::unistd::gethostname().is_ok_and(|name| name == "shroud-test")
        })
        .is_some_and(|exit| exit.success());
        let Ok(after) = NamespaceInfo::current() else {
            return false;
        };

        renamed && before.get(NamespaceKind::Pid) == after.get(NamespaceKind::Pid)
    });

    assert!(exit.success());
}

#[test]
#[ignore] // Requires root
fn test_join_twice_is_same_as_once() {
    let exit = in_forked_child(|| {
        let own = IsolationRequest::new()
            .with_join(NamespaceKind::Uts, format!("/proc/{}/ns/uts", getpid()));
        let joined_once = isolate(&own).is_ok();
        let once = NamespaceInfo::current().ok();
        let joined_twice = isolate(&own).is_ok();
        let twice = NamespaceInfo::current().ok();
        joined_once && joined_twice && once.is_some() && once == twice
    });

    assert!(exit.success());
}

#[test]
#[ignore] // Requires root
fn test_each_create_gets_its_own_namespace() {
    let request = IsolationRequest::new()
        .with_net(true)
        .with_fork(true)
        .with_wait(true);

    let inode = |request: &IsolationRequest| {
        let (mut reader, mut writer) = std::io::pipe().unwrap();
        let request = request.clone();
        let exit = in_forked_child(move || {
            run_isolated(&request, move || {
                let ino = NamespaceInfo::current()
                    .ok()
                    .and_then(|info| info.inode(NamespaceKind::Net))
                    .unwrap_or(0);
                writer.write_all(&ino.to_le_bytes()).is_ok()
            })
            .is_some_and(|exit| exit.success())
        });
        assert!(exit.success());

        let mut bytes = [0_u8; 8];
        reader.read_exact(&mut bytes).unwrap();
        u64::from_le_bytes(bytes)
    };

    let host = NamespaceInfo::current()
        .unwrap()
        .inode(NamespaceKind::Net)
        .unwrap();
    let first = inode(&request);
    let second = inode(&request);
    assert_ne!(first, 0);
    assert_ne!(first, host);
    assert_ne!(second, host);
}

#[test]
#[ignore] // Requires root
fn test_persist_without_fork_binds_own_namespace() {
    let target = tempfile::NamedTempFile::new().unwrap();
    let request = IsolationRequest::new()
        .with_uts(true)
        .with_persist(NamespaceKind::Uts, target.path());
    let path = target.path().to_path_buf();

    let exit = in_forked_child(move || {
        let joined = matches!(isolate(&request), Ok(ExecutionResult::Joined));
        let own = NamespaceInfo::current()
            .ok()
            .and_then(|info| info.inode(NamespaceKind::Uts));
        let bound = fs::metadata(&path).ok().map(|meta| meta.ino());
        joined && own.is_some() && own == bound
    });

    let _ = umount(target.path());
    assert!(exit.success());
}

#[test]
#[ignore] // Requires root
fn test_persist_with_mount_namespace_through_helper() {
    let target = tempfile::NamedTempFile::new().unwrap();
    let request = IsolationRequest::new()
        .with_uts(true)
        .with_mount(true)
        .with_fork(true)
        .with_wait(true)
        .with_persist(NamespaceKind::Uts, target.path());

    let exit = in_forked_child(move || {
        run_isolated(&request, || true).is_some_and(|exit| exit.success())
    });

    // The helper binds into this process's mount namespace
    let host = NamespaceInfo::current()
        .unwrap()
        .inode(NamespaceKind::Uts)
        .unwrap();
    let bound = fs::metadata(target.path()).unwrap().ino();
    let _ = umount(target.path());

    assert!(exit.success());
    assert_ne!(bound, host);
}

#[test]
#[ignore] // Requires root
fn test_time_namespace_monotonic_offset() {
    let host = monotonic_seconds();
    let request = IsolationRequest::new()
        .with_time(true)
        .with_fork(true)
        .with_wait(true)
        .with_time_offsets(Some(100_000), None);

    let exit = in_forked_child(move || {
        run_isolated(&request, move || monotonic_seconds() >= host + 100_000)
            .is_some_and(|exit| exit.success())
    });

    assert!(exit.success());
}

#[test]
#[ignore] // Requires root
fn test_id_maps_written() {
    let mut request = IsolationRequest::new().with_user(true);
    request.map_user = Some(IdTarget::Id(1000));
    request.map_group = Some(IdTarget::Id(1000));

    let exit = in_forked_child(move || {
        let outer_uid = geteuid().as_raw().to_string();
        let outer_gid = getegid().as_raw().to_string();
        let joined = matches!(isolate(&request), Ok(ExecutionResult::Joined));

        joined
            && words("/proc/self/uid_map") == ["1000", outer_uid.as_str(), "1"]
            && words("/proc/self/gid_map") == ["1000", outer_gid.as_str(), "1"]
            && words("/proc/self/setgroups") == ["deny"]
            && geteuid().as_raw() == 1000
    });

    assert!(exit.success());
}

#[test]
#[ignore] // Requires root
fn test_setgroups_control_written() {
    let request = IsolationRequest::new()
        .with_user(true)
        .with_setgroups(SetGroups::Deny);

    let exit = in_forked_child(move || {
        matches!(isolate(&request), Ok(ExecutionResult::Joined))
            && words("/proc/self/setgroups") == ["deny"]
    });

    assert!(exit.success());
}

#[test]
#[ignore] // Requires root
fn test_mount_propagation() {
    let private = IsolationRequest::new().with_mount(true);
    let shared = IsolationRequest::new()
        .with_mount(true)
        .with_propagation(Propagation::Shared);

    let private_exit = in_forked_child(move || {
        matches!(isolate(&private), Ok(ExecutionResult::Joined))
            && root_mount_is_shared() == Some(false)
    });
    let shared_exit = in_forked_child(move || {
        matches!(isolate(&shared), Ok(ExecutionResult::Joined))
            && root_mount_is_shared() == Some(true)
    });

    assert!(private_exit.success());
    assert!(shared_exit.success());
}

#[test]
#[ignore] // Requires root
fn test_credentials_switched_last() {
    let request = IsolationRequest::new()
        .with_fork(true)
        .with_wait(true)
        .with_credentials(Some(65534), Some(65534));

    let exit = isolate_and_check(&request, || {
        getuid().as_raw() == 65534
            && getgid().as_raw() == 65534
            && getgroups().is_ok_and(|groups| groups.is_empty())
    });

    assert!(exit.success());
}

#[test]
#[ignore] // Requires root
fn test_keep_caps_raises_ambient_set() {
    let request = IsolationRequest::new()
        .with_map_root_user()
        .with_keep_caps(true);

    let exit = in_forked_child(move || {
        let joined = matches!(isolate(&request), Ok(ExecutionResult::Joined));
        let status = fs::read_to_string("/proc/self/status").unwrap_or_default();
        let ambient = status
            .lines()
            .find_map(|line| line.strip_prefix("CapAmb:"))
            .and_then(|mask| u64::from_str_radix(mask.trim(), 16).ok())
            .unwrap_or(0);
        joined && ambient != 0
    });

    assert!(exit.success());
}

#[test]
#[ignore] // Requires root and SHROUD_TEST_ROOTFS pointing at an unpacked image
fn test_switch_root_and_exec() {
    let Ok(rootfs) = std::env::var("SHROUD_TEST_ROOTFS") else {
        return;
    };

    let request = IsolationRequest::new()
        .with_pid(true)
        .with_mount(true)
        .with_fork(true)
        .with_wait(true)
        .with_mount_proc("/proc")
        .with_root(rootfs);

    let exit = in_forked_child(move || {
        run_isolated(&request, || {
            std::process::Command::new("/bin/sh")
                .args(["-c", "test -d /proc/1"])
                .status()
                .is_ok_and(|status| status.success())
        })
        .is_some_and(|exit| exit.success())
    });

    assert_eq!(exit, ChildExit::Exited(0));
}
