//! 跨进程集成测试
//!
//! 使用 fork() 创建真正独立的进程来测试发布、挂载和清理。

#[cfg(all(test, feature = "integration"))]
mod integration {
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, pipe, ForkResult, Pid};
    use std::fs::File;
    use std::io::{Read, Write};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::thread;
    use std::time::Duration;

    use cushm_core::{
        AccessMode, Array, DType, ProgressObserver, Registry, SharedMemory, StoreConfig, Tree,
    };
    use tempfile::TempDir;

    const READERS: usize = 5;
    const POLLS: usize = 1500;

    fn registry(dir: &TempDir) -> Registry {
        let prefix = format!("cushmit{}", std::process::id());
        Registry::new(StoreConfig::new(dir.path()).with_prefix(prefix)).unwrap()
    }

    fn sample_arrays() -> Tree<Array> {
        Tree::node()
            .with(
                "values",
                Tree::Leaf(Array::from_vec(vec![4], vec![0.5f32, 1.0, 1.62, 2.0]).unwrap()),
            )
            .with(
                "nested",
                Tree::node().with("counts", Tree::Leaf(Array::zeros(vec![2, 2], DType::Int64).unwrap())),
            )
    }

    /// 检查 WaitStatus 是否表示成功退出
    fn is_exit_success(status: WaitStatus) -> bool {
        matches!(status, WaitStatus::Exited(_, code) if code == 0)
    }

    /// 在子进程中运行 `f`，以返回值决定退出码，绝不回到测试框架
    fn run_child(f: impl FnOnce() -> bool) -> ! {
        let code = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(true) => 0,
            Ok(false) => 1,
            Err(_) => 2,
        };
        std::process::exit(code);
    }

    fn spawn(f: impl FnOnce() -> bool) -> Pid {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => run_child(f),
            ForkResult::Parent { child } => child,
        }
    }

    /// 轮询直到条件成立，最多约 3 秒
    fn eventually(condition: impl Fn() -> bool) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    /// 名称以 `<prefix>.<project>.` 开头的段
    fn project_segments(project: &str) -> Vec<String> {
        let head = format!("cushmit{}.{}.", std::process::id(), project);
        std::fs::read_dir("/dev/shm")
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
                    .filter(|name| name.starts_with(&head))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 第一块数组拷贝完成后立即 abort
    struct AbortMidway;

    impl ProgressObserver for AbortMidway {
        fn start(&self, _total: u64) {}

        fn advance(&self, _transferred: u64, _total: u64) {
            std::process::abort();
        }
    }

    /// 测试发布进程退出后数据仍然存在
    #[test]
    fn test_published_data_outlives_publisher() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        // 子进程：持久发布后立即退出
        let child = spawn(|| registry.publish("outlive", &sample_arrays(), false).is_ok());
        let status = waitpid(child, None).unwrap();
        assert!(is_exit_success(status));

        // 父进程：挂载并验证数据
        let attached = registry.attach("outlive").unwrap();
        assert!(attached.is_complete());
        let values = attached.get("values").unwrap().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![0.5, 1.0, 1.62, 2.0]);
        drop(attached);

        let report = registry.teardown("outlive").unwrap();
        assert_eq!(report.unlinked().len(), 2);
    }

    /// 测试挂载进程退出不会删除数据，且写入对其他进程可见
    #[test]
    fn test_attacher_exit_keeps_data() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.publish("writer", &sample_arrays(), false).unwrap();

        let child = spawn(|| {
            let Ok(mut attached) = registry.attach("writer") else {
                return false;
            };
            let Some(view) = attached.get_mut("nested/counts") else {
                return false;
            };
            match view.as_mut_slice::<i64>() {
                Ok(counts) => {
                    counts[3] = 99;
                    true
                }
                Err(_) => false,
            }
        });
        let status = waitpid(child, None).unwrap();
        assert!(is_exit_success(status));

        let names: Vec<String> = registry
            .store()
            .load("writer")
            .unwrap()
            .leaves()
            .into_iter()
            .map(|(_, d)| d.public_name.clone())
            .collect();
        for name in &names {
            assert!(SharedMemory::exists(name), "{name}");
        }

        let attached = registry.attach_with("writer", AccessMode::ReadOnly).unwrap();
        let counts = attached.get("nested/counts").unwrap().to_vec::<i64>().unwrap();
        assert_eq!(counts, vec![0, 0, 0, 99]);
        drop(attached);

        registry.teardown("writer").unwrap();
        for name in &names {
            assert!(!SharedMemory::exists(name), "{name}");
        }
    }

    /// 测试多个进程并发读取同一数组
    #[test]
    fn test_concurrent_readers() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let publication = registry.publish_scoped("readers", &sample_arrays(), false).unwrap();

        let children: Vec<Pid> = (0..READERS)
            .map(|_| {
                spawn(|| {
                    let Ok(attached) = registry.attach_with("readers", AccessMode::ReadOnly) else {
                        return false;
                    };
                    let Some(view) = attached.get("values") else {
                        return false;
                    };
                    for _ in 0..POLLS {
                        match view.as_slice::<f32>() {
                            Ok(values) if values[2] == 1.62 => {}
                            _ => return false,
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                    true
                })
            })
            .collect();

        for child in children {
            let status = waitpid(child, None).unwrap();
            assert!(is_exit_success(status), "reader failed: {status:?}");
        }

        // 所有读者退出后数据依然完整
        assert!(registry.attach("readers").unwrap().is_complete());

        let report = publication.teardown().unwrap();
        assert_eq!(report.unlinked().len(), 2);
        assert!(!registry.store().exists("readers").unwrap());
    }

    /// 测试发布进程中途 abort 后不留下任何段
    #[test]
    #[cfg(target_os = "linux")]
    fn test_aborted_publisher_leaves_no_segments() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let child = spawn(|| {
            registry
                .publish_with_progress("aborted", &sample_arrays(), false, Some(&AbortMidway))
                .is_ok()
        });
        let status = waitpid(child, None).unwrap();
        assert!(
            matches!(status, WaitStatus::Signaled(_, Signal::SIGABRT, _)),
            "{status:?}"
        );

        // 子进程的清理进程在管道关闭后删除已创建的段
        assert!(!registry.store().exists("aborted").unwrap());
        assert!(
            eventually(|| project_segments("aborted").is_empty()),
            "{:?}",
            project_segments("aborted")
        );
    }

    /// 测试被 SIGKILL 的作用域发布进程：段和记录都被回收
    #[test]
    #[cfg(target_os = "linux")]
    fn test_killed_scoped_publisher_is_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let (ready_read, ready_write) = pipe().unwrap();

        let child = spawn(|| {
            let Ok(_publication) = registry.publish_scoped("killed", &sample_arrays(), false) else {
                return false;
            };
            if File::from(ready_write).write_all(b"1").is_err() {
                return false;
            }
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        });

        let mut ready = [0u8; 1];
        File::from(ready_read).read_exact(&mut ready).unwrap();
        let names: Vec<String> = registry
            .store()
            .load("killed")
            .unwrap()
            .leaves()
            .into_iter()
            .map(|(_, d)| d.public_name.clone())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|name| SharedMemory::exists(name)));

        kill(child, Signal::SIGKILL).unwrap();
        let status = waitpid(child, None).unwrap();
        assert!(
            matches!(status, WaitStatus::Signaled(_, Signal::SIGKILL, _)),
            "{status:?}"
        );

        assert!(eventually(|| {
            !registry.store().exists("killed").unwrap() && names.iter().all(|name| !SharedMemory::exists(name))
        }));
        assert!(project_segments("killed").is_empty());
    }
}
