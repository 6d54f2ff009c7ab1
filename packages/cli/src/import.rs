// ABOUTME: Reads token specs from JSON files for `warden import`
// ABOUTME: Accepts a single spec object or an array of them

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use warden_auth::TokenSpec;

#[derive(Deserialize)]
#[serde(untagged)]
enum SpecFile {
    Many(Vec<TokenSpec>),
    One(TokenSpec),
}

pub fn parse_token_specs(content: &str) -> Result<Vec<TokenSpec>> {
    let specs = match serde_json::from_str::<SpecFile>(content)
        .context("Expected a token object or an array of token objects")?
    {
        SpecFile::Many(specs) => specs,
        SpecFile::One(spec) => vec![spec],
    };
    if specs.is_empty() {
        bail!("No tokens to import");
    }
    Ok(specs)
}

pub fn load_token_specs(path: &Path) -> Result<Vec<TokenSpec>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_token_specs(&content).with_context(|| format!("Invalid token file {}", path.display()))
}
