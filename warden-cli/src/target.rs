use std::path::Path;
use warden_daemon::identity::{IdentityField, IdentityGenerator, RandomIdentityGenerator, TargetIdentity};

use crate::commands::TargetArgs;
use crate::errors::{CliError, Result};

/// Resolve the target named on the command line. `None` when no source was given.
pub fn resolve_target(args: &TargetArgs) -> Result<Option<TargetIdentity>> {
    if args.generate {
        return generate(&[]).map(Some);
    }
    if let Some(path) = &args.identity {
        return read_identity_file(path).map(Some);
    }
    if !args.fields.is_empty() {
        return Ok(Some(TargetIdentity::from_pairs(&args.fields)?));
    }
    Ok(None)
}

/// Parse a JSON object of `fieldName: value` pairs.
pub fn read_identity_file(path: &Path) -> Result<TargetIdentity> {
    let failed = |reason: String| CliError::IdentityFile {
        path: path.to_path_buf(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| failed(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| failed(e.to_string()))
}

/// Fresh values for `names`, or for every field when `names` is empty.
pub fn generate(names: &[String]) -> Result<TargetIdentity> {
    let fields = if names.is_empty() {
        IdentityField::ALL.to_vec()
    } else {
        names
            .iter()
            .map(|name| name.parse::<IdentityField>())
            .collect::<std::result::Result<Vec<_>, _>>()?
    };
    Ok(RandomIdentityGenerator.generate_identity(&fields)?)
}
