use crate::error::{Error, Result};

/// Validate a tenant or override-layer name.
///
/// Names must start with an alphanumeric character and may continue with
/// alphanumerics, dots, underscores, and hyphens, up to 64 characters total.
pub fn validate_name(name: &str, kind: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::validation(format!(
            "{kind} name must be 1-64 characters, got {}",
            name.len()
        )));
    }

    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(Error::validation(format!(
            "{kind} name must start with an alphanumeric character: {name:?}"
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-') {
        return Err(Error::validation(format!(
            "{kind} name may only contain alphanumerics and . _ - characters: {name:?}"
        )));
    }

    Ok(())
}

/// Normalize a user-supplied layer name: trim, replace spaces with hyphens,
/// then validate.
pub fn normalize_layer_name(name: &str) -> Result<String> {
    let slug = name.trim().replace(' ', "-");
    if slug.is_empty() {
        return Err(Error::validation("layer name cannot be empty"));
    }
    validate_name(&slug, "layer")?;
    Ok(slug)
}

/// Replace any character outside `[A-Za-z0-9_.-]` with an underscore.
/// Used where a name becomes part of a filesystem template on the guest.
pub fn sanitize_for_path(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
