//! Contacts
//!
//! A contact is one open session on a link. A link has at most one
//! current contact; the contact ends when the link leaves the open state.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Shared handle to a contact
pub type ContactRef = Arc<Contact>;

/// One open convergence-layer session on a link
#[derive(Debug)]
pub struct Contact {
    link_name: String,
    start: DateTime<Utc>,
}

impl Contact {
    /// Open a contact on the named link, starting now
    pub fn new(link_name: impl Into<String>) -> ContactRef {
        Arc::new(Self {
            link_name: link_name.into(),
            start: Utc::now(),
        })
    }

    /// The owning link's name
    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    /// When the contact opened
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start
    }

    /// Seconds since the contact opened
    pub fn duration_secs(&self) -> u64 {
        (Utc::now() - self.start).num_seconds().max(0) as u64
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "contact on {} since {}", self.link_name, self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_basics() {
        let contact = Contact::new("uplink");
        assert_eq!(contact.link_name(), "uplink");
        assert_eq!(contact.duration_secs(), 0);
    }
}
