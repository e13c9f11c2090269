//! Remote filesystem layout of a k3s node.

/// Configuration directory, fixed by k3s.
pub const CONFIG_DIR: &str = "/etc/rancher/k3s";
/// Default data directory, overridable through the `data-dir` config key.
pub const DATA_DIR: &str = "/var/lib/rancher/k3s";
pub const DEFAULT_BIN_DIR: &str = "/usr/local/bin";
pub const SYSTEMD_DIR: &str = "/etc/systemd/system";

pub const INSTALL_SCRIPT_NAME: &str = "k3s-install.sh";
pub const SERVER_UNINSTALL_SCRIPT: &str = "k3s-uninstall.sh";
pub const AGENT_UNINSTALL_SCRIPT: &str = "k3s-agent-uninstall.sh";

pub const API_PORT: u16 = 6443;

pub fn config_file() -> String {
    format!("{}/config.yaml", CONFIG_DIR)
}

pub fn registry_file() -> String {
    format!("{}/registries.yaml", CONFIG_DIR)
}

pub fn kubeconfig_file() -> String {
    format!("{}/k3s.yaml", CONFIG_DIR)
}

pub fn server_token_file(data_dir: &str) -> String {
    format!("{}/server/token", data_dir.trim_end_matches('/'))
}

pub fn unit_env_file(unit: &str) -> String {
    format!("{}/{}.service.env", SYSTEMD_DIR, unit)
}

pub fn install_script(bin_dir: &str) -> String {
    format!("{}/{}", bin_dir.trim_end_matches('/'), INSTALL_SCRIPT_NAME)
}

/// Externally reachable API endpoint for a server host.
pub fn api_url(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("https://[{}]:{}", host, API_PORT)
    } else {
        format!("https://{}:{}", host, API_PORT)
    }
}

/// Single-quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
