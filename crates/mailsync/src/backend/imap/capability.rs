//! IMAP capability parsing

/// Extensions the adapter makes use of
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImapCapabilities {
    /// RFC 6851 UID MOVE
    pub move_ext: bool,
    /// RFC 4315 UID EXPUNGE, COPYUID, APPENDUID
    pub uidplus: bool,
    /// RFC 7162 CONDSTORE
    pub condstore: bool,
    /// RFC 7162 QRESYNC (implies CONDSTORE)
    pub qresync: bool,
    pub idle: bool,
}

impl ImapCapabilities {
    /// Parse capability atoms as returned by CAPABILITY. Matching is
    /// case-insensitive; unknown atoms are ignored.
    pub fn parse<S: AsRef<str>>(atoms: &[S]) -> Self {
        let mut caps = Self::default();
        for atom in atoms {
            match atom.as_ref().trim().to_ascii_uppercase().as_str() {
                "MOVE" => caps.move_ext = true,
                "UIDPLUS" => caps.uidplus = true,
                "CONDSTORE" => caps.condstore = true,
                "QRESYNC" => {
                    caps.qresync = true;
                    caps.condstore = true;
                }
                "IDLE" => caps.idle = true,
                _ => {}
            }
        }
        caps
    }
}
