use fsmirror_core::AgentInfo;

/// Remote endpoint whose file namespace is mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub os_name: Option<String>,
}

impl Peer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            base_url: base_url.into(),
            os_name: None,
        }
    }

    pub fn with_os_name(mut self, os_name: impl Into<String>) -> Self {
        self.os_name = Some(os_name.into());
        self
    }

    /// Builds a peer from the handshake an agent answered with.
    pub fn from_agent(info: &AgentInfo, base_url: impl Into<String>) -> Self {
        Self {
            id: info.agent_id.clone(),
            name: info.agent_id.clone(),
            base_url: base_url.into(),
            os_name: info.os_name.clone(),
        }
    }

    pub fn is_windows(&self) -> bool {
        self.os_name
            .as_deref()
            .is_some_and(|os| os.starts_with("Windows"))
    }

    pub fn case_insensitive(&self) -> bool {
        self.is_windows()
    }

    pub fn names_match(&self, left: &str, right: &str) -> bool {
        self.name_key(left) == self.name_key(right)
    }

    /// Key under which a name is indexed when matching children.
    pub fn name_key(&self, name: &str) -> String {
        if self.case_insensitive() {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }
}
