//! Parsed key material for KNX Data Secure.
//!
//! Reading the ETS keyring export is left to the application; this type
//! holds only what the engine needs once the file has been decoded.

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::secure::primitives::Key;
use core::fmt;
use std::collections::HashMap;

/// Group keys and the security individual address table.
///
/// # Examples
///
/// ```rust
/// use knx_engine::secure::keyring::Keyring;
/// use knx_engine::{GroupAddress, IndividualAddress};
///
/// let keyring = Keyring::new()
///     .with_group_key("1/2/3".parse::<GroupAddress>().unwrap(), [0x11; 16])
///     .with_device("1.1.5".parse::<IndividualAddress>().unwrap(), 0)
///     .with_sequence_number(42);
/// assert!(keyring.is_secure_group(&"1/2/3".parse().unwrap()));
/// ```
#[derive(Clone, Default)]
pub struct Keyring {
    group_keys: HashMap<GroupAddress, Key>,
    devices: HashMap<IndividualAddress, u64>,
    sequence_number_sending: u64,
}

impl Keyring {
    /// Empty keyring
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the key of a secured group address.
    #[must_use]
    pub fn with_group_key(mut self, group: GroupAddress, key: Key) -> Self {
        self.group_keys.insert(group, key);
        self
    }

    /// Add a known sender with the last sequence number accepted from it.
    #[must_use]
    pub fn with_device(mut self, device: IndividualAddress, last_sequence_number: u64) -> Self {
        self.devices.insert(device, last_sequence_number);
        self
    }

    /// First sequence number used for our own secured telegrams.
    #[must_use]
    pub fn with_sequence_number(mut self, sequence_number: u64) -> Self {
        self.sequence_number_sending = sequence_number;
        self
    }

    /// Key of `group`, if it is secured.
    pub fn group_key(&self, group: &GroupAddress) -> Option<&Key> {
        self.group_keys.get(group)
    }

    /// `true` if telegrams to `group` must be secured.
    pub fn is_secure_group(&self, group: &GroupAddress) -> bool {
        self.group_keys.contains_key(group)
    }

    /// Last sequence number recorded for `device`; `None` for unknown senders.
    pub fn device_sequence_number(&self, device: &IndividualAddress) -> Option<u64> {
        self.devices.get(device).copied()
    }

    /// Sequence number for the next outgoing secured telegram.
    pub fn sequence_number_sending(&self) -> u64 {
        self.sequence_number_sending
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut groups: Vec<_> = self.group_keys.keys().collect();
        groups.sort_unstable();
        f.debug_struct("Keyring")
            .field("secure_groups", &groups)
            .field("devices", &self.devices.len())
            .field("sequence_number_sending", &self.sequence_number_sending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let ga: GroupAddress = "1/2/3".parse().unwrap();
        let ia: IndividualAddress = "1.1.5".parse().unwrap();
        let keyring = Keyring::new().with_group_key(ga, [7; 16]).with_device(ia, 99);
        assert_eq!(keyring.group_key(&ga), Some(&[7; 16]));
        assert!(!keyring.is_secure_group(&"1/2/4".parse().unwrap()));
        assert_eq!(keyring.device_sequence_number(&ia), Some(99));
        assert_eq!(keyring.device_sequence_number(&"1.1.6".parse().unwrap()), None);
        assert_eq!(keyring.sequence_number_sending(), 0);
    }

    #[test]
    fn test_debug_hides_keys() {
        let keyring = Keyring::new().with_group_key("1/2/3".parse().unwrap(), [0xAB; 16]);
        let text = format!("{keyring:?}");
        assert!(!text.contains("171"));
        assert!(text.contains("secure_groups"));
    }
}
