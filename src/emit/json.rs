use crate::error::Result;
use crate::mapper::NomadJob;

/// Pretty-printed JSON of the whole translation, warnings included
pub fn to_json(job: &NomadJob) -> Result<String> {
    let mut out = serde_json::to_string_pretty(job)?;
    out.push('\n');
    Ok(out)
}
