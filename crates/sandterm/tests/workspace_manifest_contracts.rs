use std::fs;
use std::path::{Path, PathBuf};

fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(|path| path.parent())
        .expect("crates/sandterm should have a workspace root parent")
        .to_path_buf()
}

fn crate_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root.join("crates"))
        .expect("read crates directory")
        .map(|entry| entry.expect("read crate entry").path())
        .filter(|path| path.is_dir() && path.join("Cargo.toml").exists())
        .collect();
    dirs.sort();
    dirs
}

#[test]
fn workspace_manifest_lists_every_crate_as_member_and_path_dependency() {
    let root = repo_root();
    let workspace_manifest =
        fs::read_to_string(root.join("Cargo.toml")).expect("read workspace Cargo.toml");

    let dirs = crate_dirs(&root);
    assert!(!dirs.is_empty(), "workspace should contain crates");
    for path in dirs {
        let crate_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .expect("crate directory name must be valid UTF-8");
        let expected_member = format!("\"crates/{crate_name}\"");
        assert!(
            workspace_manifest.contains(&expected_member),
            "workspace manifest is missing member {expected_member}",
        );
        if crate_name != "sandterm" {
            let expected_dependency = format!("{crate_name} = {{ path = \"crates/{crate_name}\" }}");
            assert!(
                workspace_manifest.contains(&expected_dependency),
                "workspace manifest is missing dependency entry for {crate_name}",
            );
        }
    }
}

#[test]
fn crate_manifests_inherit_internal_dependencies_from_the_workspace() {
    let root = repo_root();
    for path in crate_dirs(&root) {
        let manifest_path = path.join("Cargo.toml");
        let manifest = fs::read_to_string(&manifest_path)
            .unwrap_or_else(|_| panic!("read {}", manifest_path.display()));

        for line in manifest.lines() {
            let line = line.trim();
            if line.starts_with("sandterm-") && line.contains('=') {
                assert!(
                    line.contains(".workspace = true"),
                    "{} declares {line} outside the workspace table",
                    manifest_path.display(),
                );
            }
        }
        assert!(
            !manifest.contains("path ="),
            "{} declares a path dependency outside the workspace table",
            manifest_path.display(),
        );
    }
}
