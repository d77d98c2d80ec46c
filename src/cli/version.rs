use session_relay::config::{default_config_path, default_database_path};

/// Version banner plus the default file locations
fn banner() -> Vec<String> {
    vec![
        format!("session-relay {}", env!("CARGO_PKG_VERSION")),
        "Managed messaging sessions with webhook delivery".to_string(),
        format!("default config:   {}", default_config_path().display()),
        format!("default database: {}", default_database_path().display()),
    ]
}

pub fn execute() {
    for line in banner() {
        println!("{}", line);
    }
}
