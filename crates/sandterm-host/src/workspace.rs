use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sandterm_protocol::{DirEntry, FileNode, FileTree, RemoveOptions, SandboxError, SandboxResult};

/// Directory a host sandbox is confined to. Sandbox paths are `/`-separated
/// and always resolve inside the root.
#[derive(Debug, Clone)]
pub(crate) struct SandboxRoot {
    root: PathBuf,
}

impl SandboxRoot {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.root
    }

    /// Maps a sandbox path onto the host. `..` may not climb above the root.
    pub(crate) fn resolve(&self, path: &str) -> SandboxResult<(PathBuf, String)> {
        let mut segments: Vec<&str> = Vec::new();
        for segment in path.trim().split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(SandboxError::Io(format!(
                            "EACCES: path escapes the sandbox root, '{path}'"
                        )));
                    }
                }
                segment => segments.push(segment),
            }
        }

        let mut resolved = self.root.clone();
        for segment in &segments {
            resolved.push(segment);
        }
        Ok((resolved, format!("/{}", segments.join("/"))))
    }

    pub(crate) async fn mount(&self, tree: &FileTree) -> SandboxResult<()> {
        let mut pending: Vec<(PathBuf, &FileTree)> = vec![(self.root.clone(), tree)];
        while let Some((directory, tree)) = pending.pop() {
            tokio::fs::create_dir_all(&directory)
                .await
                .map_err(|error| io_error("mkdir", &directory, error))?;
            for (name, node) in tree.iter() {
                let target = directory.join(name);
                match node {
                    FileNode::File { contents } => {
                        tokio::fs::write(&target, contents)
                            .await
                            .map_err(|error| io_error("open", &target, error))?;
                    }
                    FileNode::Directory(children) => pending.push((target, children)),
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn list_dir(&self, path: &str) -> SandboxResult<Vec<DirEntry>> {
        let (resolved, display) = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|error| sandbox_io_error("scandir", &display, error))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|error| sandbox_io_error("scandir", &display, error))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|error| sandbox_io_error("stat", &display, error))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory: file_type.is_dir(),
            });
        }
        entries.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(entries)
    }

    pub(crate) async fn make_dir(&self, path: &str) -> SandboxResult<()> {
        let (resolved, display) = self.resolve(path)?;
        if resolved == self.root {
            return Err(SandboxError::Io(format!(
                "EEXIST: file already exists, mkdir '{display}'"
            )));
        }
        tokio::fs::create_dir(&resolved)
            .await
            .map_err(|error| sandbox_io_error("mkdir", &display, error))
    }

    pub(crate) async fn remove_dir(&self, path: &str, options: RemoveOptions) -> SandboxResult<()> {
        let (resolved, display) = self.resolve(path)?;
        if resolved == self.root {
            return Err(SandboxError::Io(
                "EPERM: operation not permitted, rmdir '/'".to_owned(),
            ));
        }
        let metadata = tokio::fs::symlink_metadata(&resolved)
            .await
            .map_err(|error| sandbox_io_error("rmdir", &display, error))?;

        let result = if !metadata.is_dir() {
            tokio::fs::remove_file(&resolved).await
        } else if options.recursive {
            tokio::fs::remove_dir_all(&resolved).await
        } else {
            tokio::fs::remove_dir(&resolved).await
        };
        result.map_err(|error| sandbox_io_error("rmdir", &display, error))
    }
}

fn error_code(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "ENOENT",
        ErrorKind::AlreadyExists => "EEXIST",
        ErrorKind::PermissionDenied => "EACCES",
        _ => "EIO",
    }
}

fn sandbox_io_error(operation: &str, display: &str, error: std::io::Error) -> SandboxError {
    SandboxError::Io(format!(
        "{}: {error}, {operation} '{display}'",
        error_code(error.kind())
    ))
}

fn io_error(operation: &str, path: &Path, error: std::io::Error) -> SandboxError {
    SandboxError::Io(format!(
        "{}: {error}, {operation} '{}'",
        error_code(error.kind()),
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use sandterm_protocol::{DirEntry, FileTree, RemoveOptions, SandboxError};

    use super::SandboxRoot;

    fn sample_tree() -> FileTree {
        FileTree::new()
            .with_directory("document", FileTree::new().with_file("blog.md", "hello"))
            .with_file("package.json", "{}")
    }

    #[test]
    fn resolve_confines_paths_to_the_root() {
        let root = SandboxRoot::new(std::env::temp_dir().join("sandterm-resolve"));

        let (resolved, display) = root.resolve("./document/../document/blog.md").expect("resolve");
        assert_eq!(resolved, root.path().join("document").join("blog.md"));
        assert_eq!(display, "/document/blog.md");

        let (resolved, display) = root.resolve("/").expect("resolve root");
        assert_eq!(resolved, root.path());
        assert_eq!(display, "/");

        assert!(matches!(
            root.resolve("../etc"),
            Err(SandboxError::Io(message)) if message.starts_with("EACCES")
        ));
    }

    #[tokio::test]
    async fn mounted_tree_is_listed_sorted_with_directory_flags() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = SandboxRoot::new(dir.path().to_path_buf());
        root.mount(&sample_tree()).await.expect("mount");

        assert_eq!(
            root.list_dir("/").await.expect("list root"),
            vec![DirEntry::directory("document"), DirEntry::file("package.json")]
        );
        let blog = std::fs::read_to_string(dir.path().join("document/blog.md")).expect("read");
        assert_eq!(blog, "hello");
    }

    #[tokio::test]
    async fn make_dir_refuses_existing_entries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = SandboxRoot::new(dir.path().to_path_buf());
        root.mount(&sample_tree()).await.expect("mount");

        root.make_dir("notes").await.expect("make dir");
        let error = root.make_dir("notes").await.expect_err("already exists");

        assert!(matches!(error, SandboxError::Io(message) if message.starts_with("EEXIST")));
        assert!(dir.path().join("notes").is_dir());
    }

    #[tokio::test]
    async fn remove_dir_handles_directories_files_and_root() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = SandboxRoot::new(dir.path().to_path_buf());
        root.mount(&sample_tree()).await.expect("mount");

        assert!(root
            .remove_dir("document", RemoveOptions { recursive: false })
            .await
            .is_err());
        root.remove_dir("document", RemoveOptions { recursive: true })
            .await
            .expect("recursive remove");
        root.remove_dir("package.json", RemoveOptions { recursive: true })
            .await
            .expect("remove file");
        assert!(root.list_dir("/").await.expect("list").is_empty());

        let error = root
            .remove_dir("/", RemoveOptions { recursive: true })
            .await
            .expect_err("root is protected");
        assert!(matches!(error, SandboxError::Io(message) if message.starts_with("EPERM")));

        let error = root
            .remove_dir("missing", RemoveOptions { recursive: true })
            .await
            .expect_err("missing entry");
        assert!(matches!(error, SandboxError::Io(message) if message.starts_with("ENOENT")));
    }
}
