use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::{Dir, OpenOptions};

use crate::{CapabilityPolicy, CapabilityViolation, SandboxAction, SandboxError};

/// Filesystem capability: mediated writes confined to one root directory.
///
/// Reads are not mediated. In strict mode every write goes through a
/// `cap_std` directory handle after the target has been checked against the
/// root; in advisory mode writes fall through to `std::fs`.
pub struct FsCap {
    root_path: PathBuf,
    root: Dir,
    strict: bool,
}

enum Target {
    Confined(PathBuf),
    Ambient(PathBuf),
}

impl FsCap {
    pub fn open(policy: &CapabilityPolicy) -> Result<Self, SandboxError> {
        let root_path = std::fs::canonicalize(&policy.allowed_root)?;
        let root = Dir::open_ambient_dir(&root_path, ambient_authority())?;
        Ok(Self {
            root_path,
            root,
            strict: policy.strict,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    /// Check a write target without performing it.
    pub fn check(&self, action: SandboxAction, path: impl AsRef<Path>) -> Result<PathBuf, CapabilityViolation> {
        let abs = normalize(&self.absolute(path.as_ref()));
        let real = canonical_prefix(&abs, action_follows(action));
        if real.starts_with(&self.root_path) {
            Ok(real)
        } else {
            Err(CapabilityViolation::new(action, path.as_ref().display().to_string()))
        }
    }

    pub fn write(&self, path: impl AsRef<Path>, contents: &[u8]) -> Result<(), SandboxError> {
        match self.target(SandboxAction::FileWrite, path.as_ref())? {
            Target::Confined(rel) => self.root.write(rel, contents)?,
            Target::Ambient(abs) => std::fs::write(abs, contents)?,
        }
        Ok(())
    }

    pub fn append(&self, path: impl AsRef<Path>, contents: &[u8]) -> Result<(), SandboxError> {
        match self.target(SandboxAction::FileWrite, path.as_ref())? {
            Target::Confined(rel) => {
                let mut file = self
                    .root
                    .open_with(rel, OpenOptions::new().append(true).create(true))?;
                file.write_all(contents)?;
            }
            Target::Ambient(abs) => {
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(abs)?;
                file.write_all(contents)?;
            }
        }
        Ok(())
    }

    pub fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<(), SandboxError> {
        match self.target(SandboxAction::CreateDir, path.as_ref())? {
            Target::Confined(rel) => self.root.create_dir_all(rel)?,
            Target::Ambient(abs) => std::fs::create_dir_all(abs)?,
        }
        Ok(())
    }

    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), SandboxError> {
        let from = self.target(SandboxAction::Rename, from.as_ref())?;
        let to = self.target(SandboxAction::Rename, to.as_ref())?;
        match (from, to) {
            (Target::Confined(a), Target::Confined(b)) => self.root.rename(a, &self.root, b)?,
            (Target::Ambient(a), Target::Ambient(b)) => std::fs::rename(a, b)?,
            _ => return Err(io::Error::new(io::ErrorKind::Other, "mixed rename targets").into()),
        }
        Ok(())
    }

    pub fn remove_file(&self, path: impl AsRef<Path>) -> Result<(), SandboxError> {
        match self.target(SandboxAction::Remove, path.as_ref())? {
            Target::Confined(rel) => self.root.remove_file(rel)?,
            Target::Ambient(abs) => std::fs::remove_file(abs)?,
        }
        Ok(())
    }

    pub fn remove_dir(&self, path: impl AsRef<Path>) -> Result<(), SandboxError> {
        match self.target(SandboxAction::Remove, path.as_ref())? {
            Target::Confined(rel) => self.root.remove_dir(rel)?,
            Target::Ambient(abs) => std::fs::remove_dir(abs)?,
        }
        Ok(())
    }

    #[cfg(unix)]
    pub fn set_permissions(&self, path: impl AsRef<Path>, mode: u32) -> Result<(), SandboxError> {
        use std::os::unix::fs::PermissionsExt;

        let perms = std::fs::Permissions::from_mode(mode);
        match self.target(SandboxAction::Chmod, path.as_ref())? {
            Target::Confined(rel) => self
                .root
                .set_permissions(rel, cap_std::fs::Permissions::from_std(perms))?,
            Target::Ambient(abs) => std::fs::set_permissions(abs, perms)?,
        }
        Ok(())
    }

    /// Create `link` pointing at `original`. Both ends must stay inside the root.
    #[cfg(unix)]
    pub fn symlink(&self, original: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<(), SandboxError> {
        let link = link.as_ref();
        let original = original.as_ref();
        match self.target(SandboxAction::Symlink, link)? {
            Target::Confined(link_rel) => {
                let link_parent = link_rel.parent().unwrap_or(Path::new(""));
                let pointee = if original.is_absolute() {
                    original.to_path_buf()
                } else {
                    self.root_path.join(link_parent).join(original)
                };
                let pointee = self.check(SandboxAction::Symlink, &pointee)?;
                let pointee_rel = pointee.strip_prefix(&self.root_path).unwrap_or(&pointee);
                self.root.symlink(relative_from(link_parent, pointee_rel), &link_rel)?;
            }
            Target::Ambient(abs) => std::os::unix::fs::symlink(original, abs)?,
        }
        Ok(())
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_path.join(path)
        }
    }

    fn target(&self, action: SandboxAction, path: &Path) -> Result<Target, SandboxError> {
        if !self.strict {
            return Ok(Target::Ambient(self.absolute(path)));
        }
        let real = self.check(action, path)?;
        let rel = real
            .strip_prefix(&self.root_path)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if rel.as_os_str().is_empty() {
            return Ok(Target::Confined(PathBuf::from(".")));
        }
        Ok(Target::Confined(rel))
    }
}

// Writes land on whatever the final component points at; the rest act on the entry itself.
fn action_follows(action: SandboxAction) -> bool {
    matches!(action, SandboxAction::FileWrite | SandboxAction::Chmod)
}

/// Lexically resolve `.` and `..`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor and re-append the rest.
fn canonical_prefix(abs: &Path, follow_last: bool) -> PathBuf {
    let (base, tail) = if follow_last {
        (abs.to_path_buf(), Vec::new())
    } else {
        match (abs.parent(), abs.file_name()) {
            (Some(parent), Some(name)) => (parent.to_path_buf(), vec![name.to_os_string()]),
            _ => (abs.to_path_buf(), Vec::new()),
        }
    };
    let mut existing = base.as_path();
    let mut rest = tail;
    loop {
        if let Ok(real) = std::fs::canonicalize(existing) {
            let mut out = real;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return abs.to_path_buf(),
        }
    }
}

#[cfg(unix)]
fn relative_from(from_dir: &Path, to: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for _ in from_dir.components() {
        out.push("..");
    }
    out.push(to);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict_cap(root: &Path) -> FsCap {
        let policy = CapabilityPolicy {
            allowed_root: root.to_path_buf(),
            strict: true,
            allow_subprocess: false,
            allow_network: false,
        };
        FsCap::open(&policy).unwrap()
    }

    #[test]
    fn write_inside_root_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let fs = strict_cap(root.path());
        fs.create_dir_all("out/nested").unwrap();
        fs.write("out/nested/a.txt", b"hello").unwrap();
        fs.append("out/nested/a.txt", b" world").unwrap();
        let text = std::fs::read_to_string(root.path().join("out/nested/a.txt")).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn write_outside_root_is_a_violation() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let fs = strict_cap(root.path());
        let target = outside.path().join("escape.txt");
        let err = fs.write(&target, b"nope").unwrap_err();
        match err {
            SandboxError::Violation(v) => assert_eq!(v.action, SandboxAction::FileWrite),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!target.exists());
    }

    #[test]
    fn parent_traversal_is_caught() {
        let root = tempfile::tempdir().unwrap();
        let fs = strict_cap(root.path());
        let err = fs.write("sub/../../escape.txt", b"x").unwrap_err();
        assert!(matches!(err, SandboxError::Violation(_)));
        let err = fs.remove_file("../anything").unwrap_err();
        assert!(matches!(err, SandboxError::Violation(v) if v.action == SandboxAction::Remove));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_dir_escape_is_caught() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("door")).unwrap();
        let fs = strict_cap(root.path());
        let err = fs.write("door/planted.txt", b"x").unwrap_err();
        assert!(matches!(err, SandboxError::Violation(_)));
        assert!(!outside.path().join("planted.txt").exists());

        let err = fs.symlink(outside.path(), "link").unwrap_err();
        assert!(matches!(err, SandboxError::Violation(v) if v.action == SandboxAction::Symlink));
    }

    #[cfg(unix)]
    #[test]
    fn rename_and_chmod_stay_confined() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let fs = strict_cap(root.path());
        fs.write("a.sh", b"#!/bin/sh\n").unwrap();
        fs.rename("a.sh", "b.sh").unwrap();
        fs.set_permissions("b.sh", 0o755).unwrap();
        let mode = std::fs::metadata(root.path().join("b.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        fs.symlink("b.sh", "c.sh").unwrap();
        assert_eq!(std::fs::read_to_string(root.path().join("c.sh")).unwrap(), "#!/bin/sh\n");
    }

    #[test]
    fn advisory_mode_allows_outside_writes() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let fs = FsCap::open(&CapabilityPolicy::permissive(root.path())).unwrap();
        let target = outside.path().join("ok.txt");
        fs.write(&target, b"fine").unwrap();
        assert!(target.exists());
    }
}
