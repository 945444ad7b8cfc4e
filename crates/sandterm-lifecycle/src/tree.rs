use sandterm_protocol::FileTree;

const PACKAGE_JSON: &str = r#"{
  "name": "vite-starter",
  "private": true,
  "version": "0.0.0",
  "type": "module",
  "scripts": {
    "dev": "vite",
    "build": "vite build",
    "preview": "vite preview"
  },
  "devDependencies": {
    "vite": "^4.0.4"
  }
}"#;

/// Project files every freshly booted sandbox starts with.
pub fn initial_file_tree() -> FileTree {
    FileTree::new()
        .with_directory(
            "document",
            FileTree::new().with_file("blog.md", "Today I bought a macbook air m4. "),
        )
        .with_file("package.json", PACKAGE_JSON)
        .with_file("aaaaaaaaaaaa", "a")
        .with_file("bbbbbbbbbbbbb", "b")
        .with_file("ccccccccccccc", "c")
        .with_file("ddddddddddddd", "d")
        .with_file("eeeeeeeeeeeeee", "e")
}

#[cfg(test)]
mod tests {
    use sandterm_protocol::FileNode;

    use super::initial_file_tree;

    #[test]
    fn initial_tree_holds_vite_manifest_and_sample_content() {
        let tree = initial_file_tree();

        assert_eq!(tree.len(), 7);
        let Some(FileNode::File { contents }) = tree.get("package.json") else {
            panic!("package.json should be a file");
        };
        assert!(contents.contains("\"dev\": \"vite\""));
        let Some(FileNode::Directory(document)) = tree.get("document") else {
            panic!("document should be a directory");
        };
        assert!(matches!(document.get("blog.md"), Some(FileNode::File { .. })));
    }
}
