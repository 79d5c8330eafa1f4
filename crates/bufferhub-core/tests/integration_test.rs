//! Cross-process tests
//!
//! Uses fork() to get truly separate processes sharing a buffer through
//! named shared memory.

#[cfg(all(test, feature = "integration", not(loom)))]
mod integration {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};
    use std::thread;
    use std::time::{Duration, Instant};

    use bufferhub_core::{
        BufferDesc, BufferHub, BufferState, ClientBit, HubConfig, PixelFormat, UsageFlags,
    };

    fn unique_config() -> HubConfig {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        HubConfig::with_prefix(&format!("/bufferhub_it_{}", ts))
    }

    fn unique_hub() -> BufferHub {
        BufferHub::new(unique_config()).unwrap()
    }

    fn vga_desc() -> BufferDesc {
        BufferDesc::new(640, 480, 1, PixelFormat::Rgba8888, UsageFlags::CPU_READ_OFTEN)
    }

    /// Check that WaitStatus is a successful exit
    fn is_exit_success(status: WaitStatus) -> bool {
        matches!(status, WaitStatus::Exited(_, code) if code == 0)
    }

    /// Poll `cond` until it holds or the timeout passes
    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// Process A registers 0x1, process B registers 0x2, A removes its bit
    /// and B observes only its own.
    #[test]
    fn test_mask_shared_across_processes() {
        let hub = unique_hub();
        let node = hub.create_buffer(vga_desc(), 0).unwrap();
        let id = node.id();
        let bit_a = node.add_new_active_clients_bit_to_mask().unwrap();
        assert_eq!(bit_a.mask(), 0x1);

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match hub.attach(id) {
                    Ok(child_node) => {
                        let bit_b = child_node.add_new_active_clients_bit_to_mask();
                        let ok = bit_b.map(|b| b.mask()) == Some(0x2)
                            && wait_until(Duration::from_secs(5), || {
                                child_node.active_clients_bit_mask() == 0x2
                            });
                        drop(child_node);
                        if ok {
                            0
                        } else {
                            1
                        }
                    }
                    Err(_) => 2,
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                assert!(wait_until(Duration::from_secs(5), || {
                    node.active_clients_bit_mask() == 0x3
                }));
                node.remove_clients_bit_from_mask(bit_a);

                let status = waitpid(child, None).unwrap();
                assert!(is_exit_success(status));
                assert_eq!(node.active_clients_bit_mask(), 0x2);
                assert_eq!(node.metadata().mapping_count(), 1);
            }
        }
    }

    /// Producer in the parent, consumer in the child, handing the buffer
    /// over through the state word alone.
    #[test]
    fn test_state_handoff_across_processes() {
        let hub = unique_hub();
        let node = hub.create_buffer(vga_desc(), 0).unwrap();
        let id = node.id();
        let producer = node.add_new_active_clients_bit_to_mask().unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match hub.attach(id) {
                    Ok(child_node) => {
                        let ok = match child_node.register_client() {
                            Ok(consumer) => {
                                let seen_posted = wait_until(Duration::from_secs(5), || {
                                    consumer.state() == BufferState::Posted
                                });
                                let pixels_ok =
                                    unsafe { *child_node.buffer_handle().as_ptr() == 0xC3 };
                                seen_posted
                                    && pixels_ok
                                    && consumer.acquire().is_ok()
                                    && consumer.release().is_ok()
                            }
                            Err(_) => false,
                        };
                        drop(child_node);
                        if ok {
                            0
                        } else {
                            1
                        }
                    }
                    Err(_) => 2,
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                assert!(wait_until(Duration::from_secs(5), || {
                    node.active_clients_bit_mask() == 0x3
                }));
                let consumer = ClientBit::from_mask(0x2).unwrap();
                let state = node.buffer_state();

                state.gain(producer).unwrap();
                unsafe { *node.buffer_handle().as_mut_ptr() = 0xC3 };
                state.post(producer).unwrap();
                state
                    .compare_and_set(consumer, BufferState::Released, BufferState::Posted)
                    .unwrap();

                // consumer guard drops after releasing, removing its bit
                assert!(wait_until(Duration::from_secs(5), || {
                    node.active_clients_bit_mask() == producer.mask()
                }));
                let status = waitpid(child, None).unwrap();
                assert!(is_exit_success(status));

                state
                    .compare_and_set(producer, BufferState::Posted, BufferState::Released)
                    .unwrap();
                state.gain(producer).unwrap();
                assert_eq!(state.client_state(producer), BufferState::Gained);
            }
        }
    }

    /// Storage survives the creator and is reclaimed by the last process
    #[test]
    fn test_last_process_reclaims_storage() {
        let hub = unique_hub();
        let node = hub.create_buffer(vga_desc(), 16).unwrap();
        let id = node.id();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match hub.attach(id) {
                    Ok(child_node) => {
                        // hold the mapping until the parent has dropped its own
                        let alone = wait_until(Duration::from_secs(5), || {
                            child_node.metadata().mapping_count() == 1
                        });
                        drop(child_node);
                        if alone {
                            0
                        } else {
                            1
                        }
                    }
                    Err(_) => 2,
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                assert!(wait_until(Duration::from_secs(5), || {
                    node.metadata().mapping_count() == 2
                }));
                drop(node);

                let status = waitpid(child, None).unwrap();
                assert!(is_exit_success(status));
                assert!(hub.attach(id).is_err());
            }
        }
    }

    /// A second process opening its own hub on the same prefix draws from
    /// the same id counter
    #[test]
    fn test_processes_draw_distinct_ids() {
        let config = unique_config();
        let hub = BufferHub::new(config.clone()).unwrap();
        let node = hub.create_buffer(vga_desc(), 0).unwrap();
        let parent_id = node.id();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match BufferHub::new(config) {
                    Ok(child_hub) => {
                        let ok = match child_hub.create_buffer(vga_desc(), 0) {
                            Ok(child_node) => {
                                let distinct = child_node.id() != parent_id;
                                drop(child_node);
                                distinct
                            }
                            Err(_) => false,
                        };
                        drop(child_hub);
                        if ok {
                            0
                        } else {
                            1
                        }
                    }
                    Err(_) => 2,
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert!(is_exit_success(status));

                let next = hub.create_buffer(vga_desc(), 0).unwrap();
                assert_ne!(next.id(), parent_id);
                assert!(next.id().get() > parent_id.get() + 1);
            }
        }
    }
}
