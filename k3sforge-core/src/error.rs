use thiserror::Error;

/// A single node's failure inside a multi-node operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub host: String,
    pub message: String,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.host, self.message)
    }
}

#[derive(Error, Debug)]
pub enum K3sError {
    #[error("Connection error to {address}: {details}")]
    Connection { address: String, details: String },

    #[error("Authentication rejected for {user}@{address}")]
    Authentication { address: String, user: String },

    #[error("Invalid credential: {message}")]
    InvalidCredential { message: String },

    #[error("Host {address} not reachable after {attempts} attempts: {details}")]
    Unreachable {
        address: String,
        attempts: u32,
        details: String,
    },

    #[error("Command '{command}' failed on {host}: {details}")]
    Command {
        host: String,
        command: String,
        details: String,
    },

    #[error("Failed to parse {what}: {details}")]
    Parse { what: String, details: String },

    #[error("Missing {key} in {path}")]
    MissingSecret { key: String, path: String },

    #[error("Unit {unit} on {host} did not become active")]
    ServiceStart {
        unit: String,
        host: String,
        diagnostics: String,
    },

    #[error("Removing node {host} from the cluster failed: {details}")]
    NodeRemoval { host: String, details: String },

    #[error("{} of {total} nodes failed: {}", .failures.len(), join_failures(.failures))]
    PartialFailure {
        total: usize,
        failures: Vec<NodeFailure>,
    },

    #[error("Asset '{name}' unavailable: {details}")]
    Asset { name: String, details: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

pub type K3sResult<T> = std::result::Result<T, K3sError>;

fn join_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl K3sError {
    /// Build a command failure, masking join secrets in the command text.
    pub fn command(host: &str, command: &str, details: impl Into<String>) -> Self {
        K3sError::Command {
            host: host.to_string(),
            command: redact_command(command),
            details: details.into(),
        }
    }

    pub fn parse(what: impl Into<String>, details: impl std::fmt::Display) -> Self {
        K3sError::Parse {
            what: what.into(),
            details: details.to_string(),
        }
    }

    /// Failure to establish or authenticate a session.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            K3sError::Connection { .. } | K3sError::Authentication { .. }
        )
    }
}

const SECRET_KEYS: &[&str] = &["K3S_TOKEN=", "K3S_AGENT_TOKEN="];
const ECHO_PAYLOAD: &str = "echo '";
const MASK: &str = "***";
const MAX_COMMAND_LEN: usize = 256;

/// Mask secret environment assignments and staged file bodies, then clip
/// what is left, so command text is safe to surface in errors and logs.
pub fn redact_command(command: &str) -> String {
    let masked = mask_echo_payloads(command);
    let mut redacted = String::with_capacity(masked.len());
    for (i, word) in masked.split(' ').enumerate() {
        if i > 0 {
            redacted.push(' ');
        }
        match SECRET_KEYS.iter().find(|key| word.starts_with(*key)) {
            Some(key) => {
                redacted.push_str(key);
                redacted.push_str(MASK);
            }
            None => redacted.push_str(word),
        }
    }

    if redacted.len() > MAX_COMMAND_LEN {
        let mut cut = MAX_COMMAND_LEN;
        while !redacted.is_char_boundary(cut) {
            cut -= 1;
        }
        redacted.truncate(cut);
        redacted.push_str("...");
    }
    redacted
}

/// Replace every `echo '<payload>'` body. File sync stages config, tokens
/// and keys this way, and base64 never contains a quote.
fn mask_echo_payloads(command: &str) -> String {
    let mut out = String::with_capacity(command.len());
    let mut rest = command;
    while let Some(start) = rest.find(ECHO_PAYLOAD) {
        let body = start + ECHO_PAYLOAD.len();
        out.push_str(&rest[..body]);
        out.push_str(MASK);
        rest = match rest[body..].find('\'') {
            Some(end) => &rest[body + end..],
            None => "",
        };
    }
    out.push_str(rest);
    out
}
