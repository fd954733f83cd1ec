use std::path::Path;

use tokio::fs;
use tracing::warn;

use crate::error::Result;

/// Sidecar file holding a child's business name in UTF-8, one line,
/// no byte-order mark. Advisory for administrators; the authoritative
/// source is the child's stored configuration.
pub const NAME_FILE: &str = "name-utf8.txt";

/// Reads the business name recorded in `dir`, if any. A missing or
/// empty file means "no recorded name".
pub async fn read_name_file(dir: &Path) -> Result<Option<String>> {
    let path = dir.join(NAME_FILE);
    let raw = match fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let name = raw.trim_start_matches('\u{feff}').trim();
    if name.is_empty() {
        Ok(None)
    } else {
        Ok(Some(name.to_string()))
    }
}

/// Records `name` in the sidecar file under `dir`, skipping the write
/// when the recorded name already matches. The write goes through a
/// temporary file and a rename so concurrent readers never observe a
/// torn name.
pub async fn write_name_file(dir: &Path, name: &str) -> Result<()> {
    if let Ok(Some(existing)) = read_name_file(dir).await
        && existing == name
    {
        return Ok(());
    }
    let tmp = dir.join(format!(".{NAME_FILE}.tmp"));
    let target = dir.join(NAME_FILE);
    fs::write(&tmp, format!("{name}\n")).await?;
    if let Err(err) = fs::rename(&tmp, &target).await {
        warn!("failed to install name file {}: {}", target.display(), err);
        let _ = fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}
