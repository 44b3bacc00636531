// Keeps requested filenames inside the served directory.
//
// The filename is glued onto the root as text, canonicalized, and then compared
// byte-for-byte against the canonical root. The comparison is a plain prefix test: a
// root of `/srv/data` also admits `/srv/data2/...` when such a sibling exists. Servers
// that need the tighter rule can consult `is_strictly_contained`.

use std::error;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum SandboxError {
    /// The joined path could not be canonicalized, usually because nothing exists there.
    Unresolvable(io::Error),

    /// The path resolved to somewhere outside the root.
    OutsideRoot(PathBuf),
}

impl error::Error for SandboxError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Unresolvable(e) => Some(e),
            Self::OutsideRoot(_) => None,
        }
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unresolvable(e) => write!(f, "Could not resolve requested path: {e}"),
            Self::OutsideRoot(p) => write!(f, "Path {} escapes the served root", p.display()),
        }
    }
}

/// The directory tree files are served from.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Canonicalizes `root` once. Failure here means the server cannot start.
    pub async fn new(root: &Path) -> io::Result<Sandbox> {
        let root = tokio::fs::canonicalize(root).await?;
        Ok(Sandbox { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a client-supplied filename to a canonical path under the root. The name is
    /// taken byte for byte, whatever its encoding.
    pub async fn resolve(&self, filename: &[u8]) -> Result<PathBuf, SandboxError> {
        // Textual join: an absolute filename must not replace the root the way
        // `Path::join` would let it.
        let mut joined = OsString::from(self.root.as_os_str());
        joined.push("/");
        joined.push(OsStr::from_bytes(filename));

        let resolved = tokio::fs::canonicalize(&joined)
            .await
            .map_err(SandboxError::Unresolvable)?;

        if self.is_contained(&resolved) {
            Ok(resolved)
        } else {
            Err(SandboxError::OutsideRoot(resolved))
        }
    }

    /// The check the server enforces: the canonical root is a leading byte prefix.
    pub fn is_contained(&self, resolved: &Path) -> bool {
        resolved
            .as_os_str()
            .as_encoded_bytes()
            .starts_with(self.root.as_os_str().as_encoded_bytes())
    }

    /// Like `is_contained`, but the byte after the prefix must be a separator or the end.
    pub fn is_strictly_contained(&self, resolved: &Path) -> bool {
        let root = self.root.as_os_str().as_encoded_bytes();
        let path = resolved.as_os_str().as_encoded_bytes();
        if !path.starts_with(root) {
            return false;
        }
        match path.get(root.len()) {
            None => true,
            Some(&b'/') => true,
            Some(_) => root.ends_with(b"/"),
        }
    }
}
