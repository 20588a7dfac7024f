//! Constraint discovery.
//!
//! Layout: `<root>/<server name>/<constraint>.sql`. Files are listed fresh on
//! every call and returned sorted by file name, so report order does not
//! depend on the filesystem's directory order.

use crate::error::SdicError;
use crate::models::ConstraintFile;
use crate::Result;
use std::path::Path;
use tracing::debug;

/// Extension a file must carry to be treated as a constraint.
pub const CONSTRAINT_EXTENSION: &str = "sql";

/// Fails with [`SdicError::DirectoryNotFound`] unless `root` is a directory.
pub fn ensure_root(root: &Path) -> Result<()> {
    if root.is_dir() {
        Ok(())
    } else {
        Err(SdicError::DirectoryNotFound {
            path: root.to_path_buf(),
        })
    }
}

/// Lists the constraint files of one server, sorted by file name.
///
/// An empty server directory yields an empty list.
///
/// # Errors
/// Returns [`SdicError::DirectoryNotFound`] when the root or the server
/// sub-directory does not exist.
pub fn list_constraints(root: &Path, server_name: &str) -> Result<Vec<ConstraintFile>> {
    ensure_root(root)?;
    let server_dir = root.join(server_name);
    if !server_dir.is_dir() {
        return Err(SdicError::DirectoryNotFound { path: server_dir });
    }

    let entries = std::fs::read_dir(&server_dir).map_err(|e| {
        SdicError::io(
            format!("Failed to list constraints in {}", server_dir.display()),
            e,
        )
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            SdicError::io(
                format!("Failed to list constraints in {}", server_dir.display()),
                e,
            )
        })?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            debug!(path = %path.display(), "Skipping non UTF-8 file name");
            continue;
        };
        if is_constraint_file(&path, &name) {
            names.push(name);
        } else {
            debug!(path = %path.display(), "Skipping non-constraint entry");
        }
    }
    names.sort();

    Ok(names
        .iter()
        .map(|name| ConstraintFile::new(server_name, &server_dir, name))
        .collect())
}

/// Resolves one explicitly named constraint of a server.
///
/// The `.sql` extension may be omitted.
///
/// # Errors
/// Returns [`SdicError::DirectoryNotFound`] for a missing server directory and
/// [`SdicError::ConstraintNotFound`] when no such constraint exists.
pub fn find_constraint(root: &Path, server_name: &str, file_name: &str) -> Result<ConstraintFile> {
    let not_found = || SdicError::ConstraintNotFound {
        server: server_name.to_string(),
        file: file_name.to_string(),
    };
    if file_name.contains(['/', '\\']) {
        return Err(not_found());
    }

    let wanted = if Path::new(file_name).extension().is_some() {
        file_name.to_string()
    } else {
        format!("{}.{}", file_name, CONSTRAINT_EXTENSION)
    };

    list_constraints(root, server_name)?
        .into_iter()
        .find(|c| c.relative_path == wanted)
        .ok_or_else(not_found)
}

fn is_constraint_file(path: &Path, name: &str) -> bool {
    !name.starts_with('.')
        && path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(CONSTRAINT_EXTENSION))
}
