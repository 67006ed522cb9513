use std::path::PathBuf;

fn parse_env_bool(var: &str) -> Option<bool> {
    std::env::var(var).ok().and_then(|value| parse_bool(&value))
}

fn parse_bool(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}

pub fn api_key_from_env() -> Option<String> {
    std::env::var("CIVITAI_API_KEY")
        .ok()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

pub fn skip_previews() -> bool {
    parse_env_bool("CIVITAI_BROWSER_SKIP_PREVIEWS").unwrap_or(false)
}

pub fn database_override() -> Option<PathBuf> {
    std::env::var_os("CIVITAI_BROWSER_DB")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
