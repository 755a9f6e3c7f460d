use std::path::{Component, Path};

use crate::TransferError;

/// Validates a manifest file name before it is joined onto the
/// destination directory.
///
/// Relative subdirectories are allowed. Rejects:
/// - Empty names and names without a final file component
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }

    let path = Path::new(file_name);

    for component in path.components() {
        let reason = match component {
            Component::ParentDir => "parent directory traversal not allowed",
            Component::Prefix(_) => "path prefix not allowed",
            Component::RootDir => "absolute path not allowed",
            Component::CurDir | Component::Normal(_) => continue,
        };
        return Err(TransferError::InvalidPath(format!("{reason}: {file_name}")));
    }

    if !matches!(path.components().next_back(), Some(Component::Normal(_))) {
        return Err(TransferError::InvalidPath(format!(
            "no file name component: {file_name}"
        )));
    }

    Ok(())
}
