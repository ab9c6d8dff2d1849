// src/cluster/editor.rs

//! External editor workflow for the admin surface.
//!
//! The edit loop itself is a pure function of (current YAML, edits); this
//! module is the thin host adapter that picks an editor, stages the buffer
//! in a private temp file and reads the result back. Re-editing on
//! validation failure is driven by the caller.

use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;

/// Editors probed on PATH when no environment variable names one
const FALLBACK_EDITORS: &[&str] = &["editor", "vi", "emacs", "nano"];

/// Pick the editor: `$VISUAL`, then `$EDITOR`, then the PATH fallbacks
pub fn detect_editor() -> Result<String> {
    if let Ok(visual) = std::env::var("VISUAL") {
        if !visual.is_empty() {
            return Ok(visual);
        }
    }

    if let Ok(editor) = std::env::var("EDITOR") {
        if !editor.is_empty() {
            return Ok(editor);
        }
    }

    for candidate in FALLBACK_EDITORS {
        if crate::migration::find_executable(candidate).is_some() {
            return Ok(candidate.to_string());
        }
    }

    Err(Error::Validation(
        "No text editor found, please set the EDITOR environment variable".to_string(),
    ))
}

/// Spawn the editor on the given content, returning the edited bytes.
///
/// The buffer is staged with mode 0600 and renamed to a `.yaml` suffix so
/// editors pick up highlighting; the temp files never outlive the call.
pub fn spawn_editor(content: &[u8]) -> Result<Vec<u8>> {
    let editor = detect_editor()?;

    let mut staged = tempfile::Builder::new()
        .prefix("paddock_editor_")
        .tempfile()?;

    fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o600))?;
    staged.write_all(content)?;
    staged.flush()?;

    let yaml_path = staged.path().with_extension("yaml");
    let (_, staged_path) = staged.keep().map_err(|e| Error::Io(e.error))?;
    fs::rename(&staged_path, &yaml_path)?;

    let result = run_editor(&editor, &yaml_path);
    let content = result.and_then(|()| Ok(fs::read(&yaml_path)?));

    let _ = fs::remove_file(&yaml_path);

    content
}

fn run_editor(editor: &str, path: &std::path::Path) -> Result<()> {
    // The editor value may carry flags ("code --wait").
    let parts: Vec<String> = editor.split_whitespace().map(String::from).collect();
    if parts.is_empty() {
        return Err(Error::Validation("Empty editor command".to_string()));
    }

    let status = Command::new(&parts[0])
        .args(&parts[1..])
        .arg(path)
        .status()
        .map_err(|e| Error::Other(format!("Failed to run editor {}: {}", parts[0], e)))?;

    if !status.success() {
        return Err(Error::Other(format!(
            "Editor {} exited with {}",
            parts[0], status
        )));
    }

    Ok(())
}
