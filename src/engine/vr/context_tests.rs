#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use nalgebra::Vector3;
    use tempfile::NamedTempFile;

    use crate::engine::EngineError;
    use crate::engine::gpu::GpuContext;
    use crate::engine::scene::ClearRenderer;
    use crate::engine::vr::context::{DEFAULT_TRACKER_ROLES, y_up_to_z_up};
    use crate::engine::vr::{
        ActionState, ContextState, ControllerModel, DeviceClass, DigitalAction, MockHandle,
        MockVrRuntime, OwnerKey, PickResult, PoseCache, PoseSnapshot, RawDevicePose, Side,
        Teleporter, TrackedDevicePose, VrContext, VrError, VrEvent, VrEventKind,
        VrInputProcessor, VrPickCalculator,
    };

    const KNUCKLES_MANIFEST: &str = r#"{
        "default_bindings": [
            { "controller_type": "knuckles", "binding_url": "bindings_knuckles.json" }
        ]
    }"#;

    fn write_manifest(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    /// A context over a scripted runtime, initialized and running. The
    /// manifest file must outlive the context.
    fn running_context() -> (VrContext, MockHandle, NamedTempFile) {
        let manifest = write_manifest(KNUCKLES_MANIFEST);
        let runtime = MockVrRuntime::new();
        let handle = runtime.handle();
        let mut context = VrContext::new(Box::new(runtime), manifest.path()).unwrap();
        context.init_system().unwrap();
        (context, handle, manifest)
    }

    fn cycle(context: &mut VrContext) {
        context.wait_get_poses().unwrap();
        context.poll_events().unwrap();
    }

    struct Recorder {
        tag: &'static str,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl VrInputProcessor for Recorder {
        fn process(&mut self, _context: &mut VrContext) {
            self.calls.lock().unwrap().push(self.tag);
        }
    }

    struct FixedPick {
        owner: OwnerKey,
        distance: f64,
    }

    impl VrPickCalculator for FixedPick {
        fn calculate(&mut self, context: &mut VrContext) {
            context.controller_mut(Side::Right).add_pick_result(PickResult {
                owner: self.owner,
                distance: self.distance,
            });
        }
    }

    #[test]
    fn adapter_composes_to_identity_with_inverse() {
        let adapter = y_up_to_z_up();
        let round_trip = adapter * adapter.inverse();

        assert!(round_trip.translation.vector.norm() < 1.0e-9);
        assert!(round_trip.rotation.angle() < 1.0e-9);
    }

    #[test]
    fn adapter_maps_runtime_axes_into_world_axes() {
        let adapter = y_up_to_z_up();

        // Runtime up (+Y) becomes world up (+Z); runtime forward (-Z)
        // becomes world forward (+X).
        let up = adapter.rotation * Vector3::new(0.0, 1.0, 0.0);
        assert!((up - Vector3::new(0.0, 0.0, 1.0)).norm() < 1.0e-9);

        let forward = adapter.rotation * Vector3::new(0.0, 0.0, -1.0);
        assert!((forward - Vector3::new(1.0, 0.0, 0.0)).norm() < 1.0e-9);
    }

    #[test]
    fn raw_pose_parsing_preserves_rotation_and_translation() {
        // Rotation of -90 degrees about +Z plus a translation.
        let raw = RawDevicePose {
            pose_valid: true,
            device_connected: true,
            device_to_origin: [
                [0.0, 1.0, 0.0, 0.5],
                [-1.0, 0.0, 0.0, 1.5],
                [0.0, 0.0, 1.0, -2.0],
            ],
            velocity: [1.0, 0.0, 0.0],
            angular_velocity: [0.0, 2.0, 0.0],
        };
        let pose = TrackedDevicePose::from_raw(7, 3, &raw);

        assert_eq!(pose.device_index(), 3);
        assert_eq!(pose.measurement_timestamp_nanos(), 7);
        assert!(pose.is_valid() && pose.is_connected());

        let iso = pose.device_to_origin();
        assert!((iso.translation.vector - Vector3::new(0.5, 1.5, -2.0)).norm() < 1.0e-6);
        let x = iso.rotation * Vector3::x();
        assert!((x - Vector3::new(0.0, -1.0, 0.0)).norm() < 1.0e-6);
        assert!((pose.velocity() - Vector3::new(1.0, 0.0, 0.0)).norm() < 1.0e-9);
    }

    #[test]
    fn init_wraps_initial_trackers_and_reads_manifest() {
        let manifest = write_manifest(KNUCKLES_MANIFEST);
        let runtime = MockVrRuntime::new();
        let handle = runtime.handle();
        handle.connect_tracker_at_init(11);
        handle.connect_tracker_at_init(10);

        let mut context = VrContext::new(Box::new(runtime), manifest.path()).unwrap();
        context.init_system().unwrap();

        assert_eq!(context.state(), ContextState::Running);
        assert_eq!(context.controller_model(), ControllerModel::Index);
        assert_eq!(
            context.trackers().keys().copied().collect::<Vec<_>>(),
            vec![10, 11]
        );
        assert_eq!(
            handle.action_manifest_path().as_deref(),
            Some(manifest.path())
        );
        // Initial enumeration is not "new" discovery.
        assert!(context.take_new_tracker_indices().is_empty());
    }

    #[test]
    fn manifest_with_focus3_binding_selects_focus3_model() {
        let manifest = write_manifest(
            r#"{ "default_bindings": [ { "binding_url": "bindings_focus3_controller.json" } ] }"#,
        );
        let runtime = MockVrRuntime::new();
        let mut context = VrContext::new(Box::new(runtime), manifest.path()).unwrap();
        context.init_system().unwrap();

        assert_eq!(context.controller_model(), ControllerModel::Focus3);
        assert_eq!(
            context.controller(Side::Left).model(),
            ControllerModel::Focus3
        );
    }

    #[test]
    fn missing_manifest_fails_fast() {
        let runtime = MockVrRuntime::new();
        let mut context =
            VrContext::new(Box::new(runtime), "/nonexistent/actions.json").unwrap();

        let err = context.init_system().unwrap_err();
        assert!(matches!(err, EngineError::Vr(VrError::ActionManifest(_))));
        assert_eq!(context.state(), ContextState::Terminated);
        assert!(context.wait_get_poses().is_err());

        // Teardown after a failed init must be safe.
        context.dispose();
        context.dispose();
    }

    #[test]
    fn manifest_without_bindings_is_a_config_error() {
        let manifest = write_manifest(r#"{ "default_bindings": [] }"#);
        let runtime = MockVrRuntime::new();
        let mut context = VrContext::new(Box::new(runtime), manifest.path()).unwrap();

        let err = context.init_system().unwrap_err();
        assert!(matches!(err, EngineError::Vr(VrError::ActionManifest(_))));
    }

    #[test]
    fn runtime_init_failure_is_fatal() {
        let manifest = write_manifest(KNUCKLES_MANIFEST);
        let runtime = MockVrRuntime::new();
        let handle = runtime.handle();
        handle.fail_init("no HMD attached");

        let mut context = VrContext::new(Box::new(runtime), manifest.path()).unwrap();
        let err = context.init_system().unwrap_err();

        match err {
            EngineError::Vr(VrError::Init(description)) => {
                assert!(description.contains("no HMD"));
            }
            other => panic!("expected init error, got {other:?}"),
        }
        assert_eq!(context.state(), ContextState::Terminated);
        assert!(matches!(
            context.wait_get_poses().unwrap_err(),
            EngineError::Vr(VrError::NotRunning)
        ));

        // The runtime never opened, so dispose must not shut it down.
        context.dispose();
        assert_eq!(handle.shutdown_count(), 0);
    }

    #[test]
    fn dispose_shuts_the_runtime_down_once() {
        let (mut context, handle, _manifest) = running_context();

        context.dispose();
        context.dispose();

        assert_eq!(handle.shutdown_count(), 1);
        assert_eq!(context.state(), ContextState::Terminated);
    }

    #[test]
    fn wait_then_poll_updates_headset_frame() {
        let (mut context, _handle, _manifest) = running_context();

        context.wait_get_poses().unwrap();
        let t0 = context
            .latest_poses()
            .expect("snapshot published")
            .measurement_timestamp_nanos();
        assert_eq!(t0, 0);

        context.poll_events().unwrap();
        assert!(context.latest_poses().is_none());
        assert!(context.headset().is_connected());

        // Headset standing at (0, 1.7, 0) in the runtime's Y-up space lands
        // at (0, 0, 1.7) in the Z-up world.
        let headset_frame = context.headset().frame();
        let world_from_headset = context.transform_to_world(headset_frame).unwrap();
        assert!(
            (world_from_headset.translation.vector - Vector3::new(0.0, 0.0, 1.7)).norm() < 1.0e-6
        );
    }

    #[test]
    fn measurement_timestamps_increase_across_cycles() {
        let (mut context, _handle, _manifest) = running_context();

        context.wait_get_poses().unwrap();
        let t0 = context.latest_poses().unwrap().measurement_timestamp_nanos();
        context.poll_events().unwrap();

        context.wait_get_poses().unwrap();
        let t1 = context.latest_poses().unwrap().measurement_timestamp_nanos();

        assert!(t1 > t0, "t1 = {t1}, t0 = {t0}");
    }

    #[test]
    fn poll_without_a_pending_snapshot_is_a_no_op() {
        let (mut context, _handle, _manifest) = running_context();

        context.poll_events().unwrap();
        assert!(!context.headset().is_connected());
    }

    #[test]
    fn cycle_refuses_to_run_before_init() {
        let manifest = write_manifest(KNUCKLES_MANIFEST);
        let runtime = MockVrRuntime::new();
        let mut context = VrContext::new(Box::new(runtime), manifest.path()).unwrap();

        assert!(matches!(
            context.wait_get_poses().unwrap_err(),
            EngineError::Vr(VrError::NotRunning)
        ));
        assert!(matches!(
            context.poll_events().unwrap_err(),
            EngineError::Vr(VrError::NotRunning)
        ));
    }

    #[test]
    fn hot_plug_creates_one_wrapper_per_new_tracker() {
        let (mut context, handle, _manifest) = running_context();

        for index in [7, 8, 7] {
            handle.set_device_class(index, DeviceClass::GenericTracker);
            handle.push_event(VrEvent {
                tracked_device_index: index,
                kind: VrEventKind::TrackedDeviceActivated,
            });
        }
        cycle(&mut context);

        assert_eq!(
            context.trackers().keys().copied().collect::<Vec<_>>(),
            vec![7, 8]
        );
        assert_eq!(context.take_new_tracker_indices(), vec![7, 8]);
        assert!(context.take_new_tracker_indices().is_empty());

        // The same device reconnecting later is not re-discovered.
        handle.push_event(VrEvent {
            tracked_device_index: 7,
            kind: VrEventKind::TrackedDeviceActivated,
        });
        cycle(&mut context);
        assert_eq!(context.trackers().len(), 2);
        assert!(context.take_new_tracker_indices().is_empty());
    }

    #[test]
    fn failed_device_class_query_skips_the_event() {
        let (mut context, handle, _manifest) = running_context();

        // No class registered for slot 9: the query fails, polling goes on.
        handle.push_event(VrEvent {
            tracked_device_index: 9,
            kind: VrEventKind::TrackedDeviceActivated,
        });
        cycle(&mut context);

        assert!(context.trackers().is_empty());
        assert!(context.take_new_tracker_indices().is_empty());
    }

    #[test]
    fn base_stations_are_discovered_from_events() {
        let (mut context, handle, _manifest) = running_context();

        handle.set_device_class(20, DeviceClass::TrackingReference);
        handle.push_event(VrEvent {
            tracked_device_index: 20,
            kind: VrEventKind::TrackedDeviceActivated,
        });
        cycle(&mut context);

        assert!(context.base_stations().contains_key(&20));
        assert!(context.take_new_tracker_indices().is_empty());
    }

    #[test]
    fn tracker_survives_disconnect_as_not_connected() {
        let manifest = write_manifest(KNUCKLES_MANIFEST);
        let runtime = MockVrRuntime::new();
        let handle = runtime.handle();
        handle.connect_tracker_at_init(12);

        let mut context = VrContext::new(Box::new(runtime), manifest.path()).unwrap();
        context.init_system().unwrap();

        handle.set_device_pose(12, RawDevicePose::at_translation(0.5, 0.9, 0.0));
        cycle(&mut context);
        assert!(context.trackers()[&12].is_connected());

        handle.set_device_pose(12, RawDevicePose::default());
        cycle(&mut context);
        let tracker = &context.trackers()[&12];
        assert!(!tracker.is_connected());
        assert_eq!(tracker.device_index(), 12);
    }

    #[test]
    fn role_reset_restores_defaults_and_arms_one_shot_flag() {
        let (mut context, _handle, _manifest) = running_context();

        context.set_tracker_role("chest", 12);
        context.set_tracker_role_unavailable("chest");
        assert_eq!(context.available_tracker_roles().len(), 5);

        context.reset_tracker_roles();

        assert!(context.assigned_tracker_roles().is_empty());
        let available: Vec<&str> = context
            .available_tracker_roles()
            .iter()
            .map(String::as_str)
            .collect();
        let mut expected = DEFAULT_TRACKER_ROLES.to_vec();
        expected.sort_unstable();
        assert_eq!(available, expected);

        assert!(context.is_roles_reset_pending());
        assert!(!context.is_roles_reset_pending());
    }

    #[test]
    fn tracker_role_lookup_follows_assignment() {
        let manifest = write_manifest(KNUCKLES_MANIFEST);
        let runtime = MockVrRuntime::new();
        let handle = runtime.handle();
        handle.connect_tracker_at_init(12);

        let mut context = VrContext::new(Box::new(runtime), manifest.path()).unwrap();
        context.init_system().unwrap();

        assert!(context.tracker_for_role("waist").is_none());
        context.set_tracker_role("waist", 12);
        assert_eq!(
            context.tracker_for_role("waist").map(|t| t.device_index()),
            Some(12)
        );
    }

    #[test]
    fn teleport_applies_exactly_once_to_descendant_frames() {
        let (mut context, _handle, _manifest) = running_context();
        cycle(&mut context);

        let headset_frame = context.headset().frame();
        let before = context.transform_to_world(headset_frame).unwrap();

        context.teleport(|teleport| teleport.translation.vector += Vector3::new(1.0, 2.0, 0.0));

        let after = context.transform_to_world(headset_frame).unwrap();
        let expected = before.translation.vector + Vector3::new(1.0, 2.0, 0.0);
        assert!((after.translation.vector - expected).norm() < 1.0e-9);

        // Reading again must not re-apply anything.
        let again = context.transform_to_world(headset_frame).unwrap();
        assert!((again.translation.vector - expected).norm() < 1.0e-9);
    }

    #[test]
    fn input_processors_run_in_registration_order() {
        let (mut context, _handle, _manifest) = running_context();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let owners = [OwnerKey::new(), OwnerKey::new(), OwnerKey::new()];
        for (owner, tag) in owners.iter().zip(["a", "b", "c"]) {
            context.add_input_processor(
                *owner,
                Arc::new(Mutex::new(Recorder {
                    tag,
                    calls: calls.clone(),
                })),
            );
        }

        cycle(&mut context);
        assert_eq!(*calls.lock().unwrap(), vec!["a", "b", "c"]);

        // Order is stable across frames.
        cycle(&mut context);
        assert_eq!(*calls.lock().unwrap(), vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn removing_one_owner_leaves_the_others_order_intact() {
        let (mut context, _handle, _manifest) = running_context();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let owners = [OwnerKey::new(), OwnerKey::new(), OwnerKey::new()];
        for (owner, tag) in owners.iter().zip(["a", "b", "c"]) {
            context.add_input_processor(
                *owner,
                Arc::new(Mutex::new(Recorder {
                    tag,
                    calls: calls.clone(),
                })),
            );
        }

        context.remove_input_processor(owners[1]);
        cycle(&mut context);
        assert_eq!(*calls.lock().unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn pick_results_are_resolved_before_input_processors_run() {
        let (mut context, _handle, _manifest) = running_context();

        let near_owner = OwnerKey::new();
        context.add_pick_calculator(
            OwnerKey::new(),
            Arc::new(Mutex::new(FixedPick {
                owner: OwnerKey::new(),
                distance: 2.0,
            })),
        );
        context.add_pick_calculator(
            OwnerKey::new(),
            Arc::new(Mutex::new(FixedPick {
                owner: near_owner,
                distance: 0.5,
            })),
        );

        struct AssertSelected {
            expected_owner: OwnerKey,
            observed: Arc<Mutex<Option<PickResult>>>,
        }
        impl VrInputProcessor for AssertSelected {
            fn process(&mut self, context: &mut VrContext) {
                let selected = context.controller(Side::Right).selected_pick();
                assert_eq!(selected.map(|p| p.owner), Some(self.expected_owner));
                *self.observed.lock().unwrap() = selected;
            }
        }

        let observed = Arc::new(Mutex::new(None));
        context.add_input_processor(
            OwnerKey::new(),
            Arc::new(Mutex::new(AssertSelected {
                expected_owner: near_owner,
                observed: observed.clone(),
            })),
        );

        cycle(&mut context);
        let selected = observed.lock().unwrap().expect("processor observed a pick");
        assert!((selected.distance - 0.5).abs() < 1.0e-12);
    }

    #[test]
    fn snapshot_swap_never_exposes_mixed_timestamps() {
        let cache = Arc::new(PoseCache::new());

        let writer = {
            let cache = cache.clone();
            thread::spawn(move || {
                for stamp in 0..1_000i64 {
                    let poses = (0..8)
                        .map(|index| {
                            TrackedDevicePose::from_raw(
                                stamp,
                                index,
                                &RawDevicePose::at_translation(index as f32, 0.0, 0.0),
                            )
                        })
                        .collect();
                    cache.publish(PoseSnapshot::new(stamp, poses));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        if let Some(snapshot) = cache.latest() {
                            let stamp = snapshot.measurement_timestamp_nanos();
                            for pose in snapshot.poses() {
                                assert_eq!(pose.measurement_timestamp_nanos(), stamp);
                            }
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    struct NullScene;

    impl crate::engine::scene::SceneRenderer for NullScene {
        fn render(
            &mut self,
            _view: &nalgebra::Isometry3<f64>,
            _projection: &nalgebra::Matrix4<f32>,
            _eye: &crate::engine::vr::Eye,
        ) -> crate::engine::EngineResult<()> {
            Ok(())
        }
    }

    #[test]
    fn render_eyes_without_surfaces_is_an_error() {
        let (mut context, _handle, _manifest) = running_context();
        cycle(&mut context);

        let err = context.render_eyes(&mut NullScene).unwrap_err();
        assert!(matches!(err, EngineError::Vr(VrError::NoEyeSurfaces)));
    }

    #[test]
    fn end_to_end_cycle_submits_both_eyes() {
        let (mut context, handle, _manifest) = running_context();

        let gpu = match GpuContext::new() {
            Ok(gpu) => gpu,
            Err(_) => return,
        };
        context.setup_eyes(&gpu).unwrap();
        let mut scene = ClearRenderer::new(&gpu, [0.1, 0.2, 0.3, 1.0]);

        context.wait_get_poses().unwrap();
        let t0 = context.latest_poses().unwrap().measurement_timestamp_nanos();
        context.poll_events().unwrap();
        context.render_eyes(&mut scene).unwrap();

        let submitted = handle.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].0, Side::Left);
        assert_eq!(submitted[1].0, Side::Right);
        assert_ne!(submitted[0].1.texture_id, submitted[1].1.texture_id);
        let extent = context.render_size();
        assert_eq!(submitted[0].1.extent, [extent.width, extent.height]);

        context.wait_get_poses().unwrap();
        let t1 = context.latest_poses().unwrap().measurement_timestamp_nanos();
        assert!(t1 > t0);

        context.dispose();
        assert_eq!(handle.shutdown_count(), 1);
    }

    #[test]
    fn teleporter_snaps_headset_onto_the_picked_floor_point() {
        let (mut context, handle, _manifest) = running_context();
        let _teleporter = Teleporter::register(&context, OwnerKey::new());

        // Right controller at (0.2, 1.2, 0) in the runtime's Y-up space,
        // rotated -90 degrees about +Z so its forward ray points at the
        // floor once converted to the Z-up world.
        handle.set_device_pose(
            2,
            RawDevicePose {
                pose_valid: true,
                device_connected: true,
                device_to_origin: [
                    [0.0, 1.0, 0.0, 0.2],
                    [-1.0, 0.0, 0.0, 1.2],
                    [0.0, 0.0, 1.0, 0.0],
                ],
                velocity: [0.0; 3],
                angular_velocity: [0.0; 3],
            },
        );

        // Press and hold B: the landing pose is proposed from the ray.
        let mut actions = ActionState::default();
        actions.right.b_button = DigitalAction {
            state: true,
            changed: true,
        };
        handle.set_actions(actions);
        cycle(&mut context);

        // Release B: the teleport frame snaps.
        actions.right.b_button = DigitalAction {
            state: false,
            changed: true,
        };
        handle.set_actions(actions);
        cycle(&mut context);

        let headset_frame = context.headset().frame();
        let world_from_headset = context.transform_to_world(headset_frame).unwrap();
        let p = world_from_headset.translation.vector;
        // The ray lands at the controller's ground projection (0, -0.2);
        // eye height is preserved.
        assert!((p.x - 0.0).abs() < 1.0e-6, "x = {}", p.x);
        assert!((p.y - -0.2).abs() < 1.0e-6, "y = {}", p.y);
        assert!((p.z - 1.7).abs() < 1.0e-6, "z = {}", p.z);
    }

    #[test]
    fn touchpad_travel_translates_the_teleport_frame_vertically() {
        let (mut context, handle, _manifest) = running_context();
        let _teleporter = Teleporter::register(&context, OwnerKey::new());

        let mut actions = ActionState::default();
        actions.right.touchpad_touched = DigitalAction {
            state: true,
            changed: true,
        };
        actions.right.touchpad = [0.0, 0.0];
        handle.set_actions(actions);
        cycle(&mut context);

        actions.right.touchpad_touched = DigitalAction {
            state: true,
            changed: false,
        };
        actions.right.touchpad = [0.0, 0.5];
        handle.set_actions(actions);
        cycle(&mut context);

        let headset_frame = context.headset().frame();
        let world_from_headset = context.transform_to_world(headset_frame).unwrap();
        // 0.5 of touchpad travel at a gain of 0.3 lifts the rig 0.15 m.
        assert!((world_from_headset.translation.vector.z - 1.85).abs() < 1.0e-6);

        // Lifting a finger resets the reference; re-touching elsewhere must
        // not jump.
        actions.right.touchpad_touched = DigitalAction {
            state: false,
            changed: true,
        };
        handle.set_actions(actions);
        cycle(&mut context);

        actions.right.touchpad_touched = DigitalAction {
            state: true,
            changed: true,
        };
        actions.right.touchpad = [0.0, -0.4];
        handle.set_actions(actions);
        cycle(&mut context);

        let world_from_headset = context.transform_to_world(headset_frame).unwrap();
        assert!((world_from_headset.translation.vector.z - 1.85).abs() < 1.0e-6);
    }
}
