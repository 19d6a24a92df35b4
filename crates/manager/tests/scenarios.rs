//! End-to-end scenarios through the unified manager

use patchloop_common::{HotpatchConfig, HotpatchContext, HotpatchEvent, PatchLayer};
use patchloop_engine::{BytePatch, MemoryPatch, PatchKind};
use patchloop_manager::{LayerFlags, UnifiedHotpatchManager};
use patchloop_pipeline::ServerRule;
use serde_json::json;
use std::io::Write;

fn manager() -> UnifiedHotpatchManager {
    let manager =
        UnifiedHotpatchManager::with_context(HotpatchContext::isolated(), HotpatchConfig::default());
    assert!(manager.initialize().success);
    manager
}

#[test]
fn batch_apply_and_revert_on_one_mebibyte_region() {
    let manager = manager();
    let mut region = vec![0u8; 1024 * 1024];
    let attached = unsafe { manager.attach_to_model(region.as_mut_ptr(), region.len(), None) };
    assert!(attached.success, "{}", attached.detail);

    let memory = manager.memory().unwrap();
    memory
        .add_patch(MemoryPatch::new("A", PatchKind::WeightModification, 0, vec![0xAA; 16]).priority(1))
        .unwrap();
    memory
        .add_patch(MemoryPatch::new("B", PatchKind::WeightModification, 1024, vec![0xBB; 16]).priority(1))
        .unwrap();

    let applied = memory.apply_all_patches();
    assert!(applied.all_succeeded(), "{}", applied.summary());
    assert_eq!(applied.succeeded.len(), 2);

    let stats = memory.statistics();
    assert_eq!(stats.applied_patches, 2);
    assert_eq!(stats.bytes_modified, 32);
    assert_eq!(memory.read_memory(1024, 16).unwrap(), vec![0xBB; 16]);

    let reverted = memory.revert_all_patches();
    assert!(reverted.all_succeeded(), "{}", reverted.summary());
    assert!(memory.read_memory(0, region.len()).unwrap().iter().all(|&b| b == 0));

    assert!(manager.detach_all().success);
    assert!(region.iter().all(|&b| b == 0));
}

#[test]
fn presets_survive_export_and_import() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("patchloop-presets.json");

    let first = manager();
    first.set_layer_flags(LayerFlags {
        memory: true,
        byte: false,
        server: true,
    });
    assert!(first.save_preset("p1").success);
    assert!(first.export_configuration(&path).success);

    let second = manager();
    let imported = second.import_configuration(&path);
    assert!(imported.success, "{}", imported.detail);
    assert_eq!(second.list_presets(), vec!["p1".to_string()]);
    assert_eq!(second.preset_flags("p1"), first.preset_flags("p1"));
    assert_eq!(
        second.preset_flags("p1"),
        Some(LayerFlags {
            memory: true,
            byte: false,
            server: true,
        })
    );

    assert!(second.load_preset("p1").success);
    assert!(!second.layer_flags().byte);
}

#[test]
fn server_rules_redact_and_override() {
    let manager = manager();
    assert!(manager.add_server_hotpatch(ServerRule::filter("rule1", ["secret"])).success);
    assert!(manager
        .add_server_hotpatch(ServerRule::parameter("rule2", "temperature", json!(0.2)))
        .success);

    let server = manager.server().unwrap();
    assert_eq!(
        server.process_request(json!({"temperature": 0.9})),
        json!({"temperature": 0.2})
    );
    assert_eq!(
        server.process_response(json!({"content": "the secret is X"})),
        json!({"content": "the ****** is X"})
    );

    let duplicate = manager.add_server_hotpatch(ServerRule::filter("rule1", ["other"]));
    assert!(!duplicate.success);
    assert_eq!(duplicate.layer, PatchLayer::Server);
}

#[test]
fn byte_layer_patches_loaded_model_file() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.bin");
    let mut file = std::fs::File::create(&model).unwrap();
    file.write_all(b"GGUF").unwrap();
    file.write_all(&[0u8; 252]).unwrap();
    drop(file);

    let manager = manager();
    let mut region = std::fs::read(&model).unwrap();
    let attached = unsafe { manager.attach_to_model(region.as_mut_ptr(), region.len(), Some(model.as_path())) };
    assert!(attached.success, "{}", attached.detail);
    assert_eq!(manager.model_path().as_deref(), Some(model.as_path()));

    let result = manager.apply_byte_patch(BytePatch::replace("stamp", 16, b"PATCHED".to_vec()));
    assert!(result.success, "{}", result.detail);

    let out = dir.path().join("patched.bin");
    assert!(manager.save_patched_model(&out).success);
    let saved = std::fs::read(&out).unwrap();
    assert_eq!(&saved[16..23], b"PATCHED");
    assert_eq!(&saved[..4], b"GGUF");

    let stats = manager.statistics();
    assert_eq!(stats.total_patches_applied, 1);
    assert_eq!(stats.total_bytes_modified, 7);
    assert_eq!(stats.byte.unwrap().patches_applied, 1);

    manager.detach_all();
}

#[test]
fn coordinated_operation_reports_completion_event() {
    let manager = manager();
    let events = manager.subscribe();

    let results = manager.boost_inference_speed();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success));

    let completed = events.try_iter().find_map(|event| match event {
        HotpatchEvent::OptimizationComplete {
            operation,
            succeeded,
            total,
        } => Some((operation, succeeded, total)),
        _ => None,
    });
    assert_eq!(completed, Some(("boost_inference_speed".to_string(), 2, 2)));
}
