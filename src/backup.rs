use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const DB_FILE: &str = "academia.sqlite3";
const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/academia.sqlite3";
const CHECKSUMS_ENTRY: &str = "meta/checksums.json";
pub const BUNDLE_FORMAT_V1: &str = "academia-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub sha256_verified: bool,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn write_json_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start bundle entry {}", name))?;
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize bundle entry {}", name))?;
    zip.write_all(text.as_bytes())
        .with_context(|| format!("failed to write bundle entry {}", name))?;
    Ok(())
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!("workspace database not found: {}", db_path.display()));
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.display()))?;
    let db_sha256 = sha256_hex(&db_bytes);

    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);

    write_json_entry(
        &mut zip,
        MANIFEST_ENTRY,
        &json!({
            "format": BUNDLE_FORMAT_V1,
            "version": 1,
            "appVersion": env!("CARGO_PKG_VERSION"),
            "exportedAt": unix_now(),
        }),
    )?;

    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;

    write_json_entry(&mut zip, CHECKSUMS_ENTRY, &json!({ DB_ENTRY: db_sha256 }))?;
    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 3,
        sha256: db_sha256,
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("failed to create workspace {}", workspace_path.display()))?;
    let dst = workspace_path.join(DB_FILE);

    if !is_zip_file(in_path)? {
        // Bare sqlite file from the pre-bundle exporter.
        std::fs::copy(in_path, &dst)
            .with_context(|| format!("failed to copy raw sqlite backup to {}", dst.display()))?;
        return Ok(ImportSummary {
            bundle_format_detected: "legacy-sqlite3".to_string(),
            sha256_verified: false,
        });
    }

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    check_manifest(&mut archive)?;
    let expected_sha256 = read_expected_sha256(&mut archive)?;

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .context("bundle missing db/academia.sqlite3")?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database entry")?;

    // Verify before anything lands in the workspace.
    let mut verified = false;
    if let Some(expected) = expected_sha256 {
        let actual = sha256_hex(&db_bytes);
        if actual != expected {
            return Err(anyhow!(
                "database checksum mismatch: expected {}, got {}",
                expected,
                actual
            ));
        }
        verified = true;
    }

    replace_database(workspace_path, &dst, &db_bytes)?;

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
        sha256_verified: verified,
    })
}

fn check_manifest<R: Read + Seek>(archive: &mut ZipArchive<R>) -> anyhow::Result<()> {
    let mut text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    Ok(())
}

fn read_expected_sha256<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> anyhow::Result<Option<String>> {
    let mut text = String::new();
    match archive.by_name(CHECKSUMS_ENTRY) {
        Ok(mut entry) => {
            entry
                .read_to_string(&mut text)
                .context("failed to read checksums entry")?;
        }
        // Older exporters shipped no checksum entry; import still works, unverified.
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e).context("failed to open checksums entry"),
    }
    let checksums: serde_json::Value =
        serde_json::from_str(&text).context("checksums entry is invalid JSON")?;
    Ok(checksums
        .get(DB_ENTRY)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_lowercase()))
}

fn replace_database(workspace_path: &Path, dst: &Path, db_bytes: &[u8]) -> anyhow::Result<()> {
    // Stage next to the target so the final rename stays on one filesystem.
    let staged = workspace_path.join(format!("{}.importing", DB_FILE));
    if staged.exists() {
        let _ = std::fs::remove_file(&staged);
    }
    let mut out = File::create(&staged)
        .with_context(|| format!("failed to create temp database {}", staged.display()))?;
    out.write_all(db_bytes)
        .context("failed to write extracted database")?;
    out.flush().context("failed to flush extracted database")?;
    drop(out);

    if dst.exists() {
        std::fs::remove_file(dst)
            .with_context(|| format!("failed to remove existing database {}", dst.display()))?;
    }
    std::fs::rename(&staged, dst)
        .with_context(|| format!("failed to move extracted database to {}", dst.display()))?;
    Ok(())
}

// Zip local-file-header magic; anything else is treated as a bare sqlite file.
fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut sig = [0u8; 4];
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    match f.read(&mut sig) {
        Ok(4) => Ok(&sig == b"PK\x03\x04"),
        Ok(_) => Ok(false),
        Err(e) => Err(e).context("failed to read file signature"),
    }
}
