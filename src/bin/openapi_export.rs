//! Writes the storefront OpenAPI document to disk.
//!
//! Usage: `openapi-export [output-path]`, defaulting to
//! `openapi/storefront-payments.v1.json`.

use std::{env, fs, path::PathBuf};

use storefront_payments::openapi::ApiDocV1;
use utoipa::OpenApi;

const DEFAULT_OUTPUT: &str = "openapi/storefront-payments.v1.json";

fn main() -> anyhow::Result<()> {
    let output_path = env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));

    let doc = ApiDocV1::openapi();
    let paths = doc.paths.paths.len();
    let json = serde_json::to_string_pretty(&doc)?;

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&output_path, json)?;

    println!(
        "Wrote {} paths (v{}) to {}",
        paths,
        doc.info.version,
        output_path.display()
    );
    Ok(())
}
