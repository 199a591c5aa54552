use std::collections::HashSet;

use super::{BrokerSettings, DirectorySettings, OidcApplication, Settings, parse_timeout};
use crate::broker::render_claim_template;

type ValidationResult = std::result::Result<(), String>;

pub(crate) fn validate_settings(settings: &Settings) -> ValidationResult {
    validate_directory(&settings.directory)?;
    validate_broker(&settings.broker)?;
    if !settings.broker.oidc_applications.is_empty() {
        let Some(dependent) = settings.dependent_service.as_ref() else {
            return Err(
                "dependent_service is required when oidc_applications are declared".to_string(),
            );
        };
        require_non_empty("dependent_service.name", &dependent.name)?;
        require_non_empty("dependent_service.host", &dependent.host)?;
    }
    Ok(())
}

fn validate_directory(directory: &DirectorySettings) -> ValidationResult {
    require_non_empty("directory.host", &directory.host)?;
    require_non_empty("directory.dc", &directory.dc)?;
    require_non_empty("directory.ou_groups", &directory.ou_groups)?;
    require_non_empty("directory.ou_users", &directory.ou_users)?;
    require_non_empty("directory.bind_user", &directory.bind_user)?;
    parse_timeout("directory.timeout", &directory.timeout).map_err(|err| err.to_string())?;

    let mut seen = HashSet::new();
    for group in &directory.groups {
        require_non_empty("directory.groups[]", group)?;
        if !seen.insert(group.as_str()) {
            return Err(format!("directory.groups contains duplicate group {group}"));
        }
    }
    check_id_range("directory.group_id_base", directory.group_id_base, directory.groups.len())?;

    let mut seen_users = HashSet::new();
    for user in &directory.users {
        require_non_empty("directory.users[].uid", &user.uid)?;
        require_non_empty("directory.users[].first_name", &user.first_name)?;
        require_non_empty("directory.users[].last_name", &user.last_name)?;
        require_non_empty("directory.users[].password", &user.password)?;
        if !seen_users.insert(user.uid.as_str()) {
            return Err(format!("directory.users contains duplicate uid {}", user.uid));
        }
        if !seen.contains(user.group.as_str()) {
            return Err(format!(
                "directory.users[{}].group {} is not a configured group",
                user.uid, user.group
            ));
        }
    }
    check_id_range("directory.user_id_base", directory.user_id_base, directory.users.len())
}

fn validate_broker(broker: &BrokerSettings) -> ValidationResult {
    if broker.protocol != "http" && broker.protocol != "https" {
        return Err(format!(
            "broker.protocol must be http or https, got {}",
            broker.protocol
        ));
    }
    require_non_empty("broker.host", &broker.host)?;
    require_non_empty("broker.auth_mount", &broker.auth_mount)?;
    require_path_segment("broker.default_group", &broker.default_group)?;
    if broker.secrets_file.as_os_str().is_empty() {
        return Err("broker.secrets_file must not be empty".to_string());
    }
    if broker.secret_shares == 0 {
        return Err("broker.secret_shares must be greater than 0".to_string());
    }
    if broker.secret_threshold == 0 {
        return Err("broker.secret_threshold must be greater than 0".to_string());
    }
    if broker.secret_threshold > broker.secret_shares {
        return Err("broker.secret_threshold must be <= broker.secret_shares".to_string());
    }
    parse_timeout("broker.request_timeout", &broker.request_timeout)
        .map_err(|err| err.to_string())?;

    let mut appnames = HashSet::new();
    let mut providers = HashSet::new();
    for app in &broker.oidc_applications {
        validate_application(app)?;
        if !appnames.insert(app.appname.as_str()) {
            return Err(format!("duplicate OIDC application {}", app.appname));
        }
        if !providers.insert(app.provider_name.as_str()) {
            return Err(format!("duplicate OIDC provider {}", app.provider_name));
        }
    }
    Ok(())
}

fn validate_application(app: &OidcApplication) -> ValidationResult {
    require_path_segment("oidc_applications[].appname", &app.appname)?;
    require_path_segment("oidc_applications[].provider_name", &app.provider_name)?;
    require_non_empty("oidc_applications[].redirect_uri", &app.redirect_uri)?;
    if app.output_path.as_os_str().is_empty() {
        return Err(format!(
            "oidc_applications[{}].output_path must not be empty",
            app.appname
        ));
    }
    let mut scopes = HashSet::new();
    for scope in &app.scopes {
        require_path_segment("oidc_applications[].scopes[].name", &scope.name)?;
        if !scopes.insert(scope.name.as_str()) {
            return Err(format!(
                "oidc_applications[{}] declares scope {} twice",
                app.appname, scope.name
            ));
        }
        render_claim_template(&scope.template, "accessor").map_err(|err| {
            format!(
                "oidc_applications[{}].scopes[{}].template: {err}",
                app.appname, scope.name
            )
        })?;
    }
    Ok(())
}

fn require_non_empty(key: &str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(format!("{key} must not be empty"));
    }
    Ok(())
}

// Used verbatim as the last segment of a broker API path.
fn require_path_segment(key: &str, value: &str) -> ValidationResult {
    require_non_empty(key, value)?;
    if let Some(c) = value
        .chars()
        .find(|c| matches!(c, '/' | '?' | '#' | '%') || c.is_whitespace())
    {
        return Err(format!("{key} {value:?} must not contain {c:?}"));
    }
    Ok(())
}

fn check_id_range(key: &str, base: u32, count: usize) -> ValidationResult {
    let count = u32::try_from(count).map_err(|_| format!("{key}: too many entries"))?;
    if base.checked_add(count).is_none() {
        return Err(format!("{key}: id range overflows"));
    }
    Ok(())
}
