/// Named preference namespaces. Each one is its own encrypted file under its
/// own keystore key, so corrupting or rotating one leaves the others intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Files {
    MasterKey,
    Fingerprint,
    SessionMetadata,
    Settings,
}

impl Files {
    pub const ALL: [Files; 4] = [
        Files::MasterKey,
        Files::Fingerprint,
        Files::SessionMetadata,
        Files::Settings,
    ];

    pub fn filename(&self) -> &'static str {
        match self {
            Files::MasterKey => "master_key",
            Files::Fingerprint => "fingerprint",
            Files::SessionMetadata => "session_metadata",
            Files::Settings => "settings",
        }
    }

    /// Keystore alias of the key the file is encrypted under.
    pub fn keystore_alias(&self) -> String {
        format!("store.{}", self.filename())
    }
}

impl std::fmt::Display for Files {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.filename())
    }
}
