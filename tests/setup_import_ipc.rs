mod test_support;

use serde_json::json;
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_dir};

#[test]
fn import_section_get_update_roundtrip_and_validation() {
    let workspace = temp_dir("hrimport-setup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let before = request(&mut stdin, &mut reader, "0", "setup.get", json!({}));
    assert_eq!(error_code(&before), Some("no_workspace"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let all = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(all["import"], json!({ "chunkSize": 1000, "maxRows": 50000 }));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "import", "patch": { "chunkSize": 250 } }),
    );
    assert_eq!(updated, json!({ "chunkSize": 250, "maxRows": 50000 }));

    for (i, patch) in [
        json!({ "chunkSize": 0 }),
        json!({ "chunkSize": 5001 }),
        json!({ "maxRows": "many" }),
        json!({ "batch": 10 }),
    ]
    .into_iter()
    .enumerate()
    {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad-{}", i),
            "setup.update",
            json!({ "section": "import", "patch": patch }),
        );
        assert_eq!(error_code(&resp), Some("bad_params"), "{}", resp);
    }
    let unknown = request(
        &mut stdin,
        &mut reader,
        "4",
        "setup.get",
        json!({ "section": "printer" }),
    );
    assert_eq!(error_code(&unknown), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();

    // Settings live in the workspace, so a new process sees them.
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "setup.get",
        json!({ "section": "import" }),
    );
    assert_eq!(section["chunkSize"], json!(250));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
