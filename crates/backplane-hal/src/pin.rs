//! Pin identifiers, capability sets and the per-bridge pin-state table.
//!
//! The table is built once from a [`Capabilities`] probe and never grows:
//! every lookup of an undiscovered pin fails, and handlers turn that failure
//! into an "invalid pin" problem.

use std::collections::BTreeMap;
use std::fmt;

use backplane_types::PinMode;

use crate::capability::Capabilities;

/// Stable identifier for a pin: a numeric index (Arduino, BCM GPIO) or a
/// header name (`"P9_14"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PinId {
    Index(u16),
    Named(String),
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinId::Index(n) => write!(f, "{n}"),
            PinId::Named(name) => f.write_str(name),
        }
    }
}

impl From<u16> for PinId {
    fn from(n: u16) -> Self {
        PinId::Index(n)
    }
}

impl From<&str> for PinId {
    fn from(name: &str) -> Self {
        PinId::Named(name.to_string())
    }
}

/// Which namespace a pin id lives in. Analog channels are numbered
/// separately from digital pins on most boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bank {
    Digital,
    Analog,
}

/// Bit set of [`PinMode`]s a pin supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeSet(u16);

impl ModeSet {
    pub const EMPTY: ModeSet = ModeSet(0);

    fn bit(mode: PinMode) -> u16 {
        1 << (mode as u16)
    }

    pub fn of(modes: &[PinMode]) -> Self {
        let mut set = Self::EMPTY;
        for &m in modes {
            set.insert(m);
        }
        set
    }

    pub fn insert(&mut self, mode: PinMode) {
        self.0 |= Self::bit(mode);
    }

    pub fn contains(self, mode: PinMode) -> bool {
        self.0 & Self::bit(mode) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Configuration of one pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinState {
    pub mode: PinMode,
    pub enabled: bool,
    pub supported: ModeSet,
}

impl PinState {
    pub fn new(supported: ModeSet) -> Self {
        Self {
            mode: PinMode::Unset,
            enabled: false,
            supported,
        }
    }
}

/// Arena of pin states indexed by [`PinId`], split by [`Bank`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PinTable {
    digital: BTreeMap<PinId, PinState>,
    analog: BTreeMap<PinId, PinState>,
}

impl PinTable {
    pub fn from_capabilities(caps: &Capabilities) -> Self {
        let digital = caps
            .digital
            .iter()
            .map(|(id, modes)| (id.clone(), PinState::new(*modes)))
            .collect();
        let analog = caps
            .analog
            .iter()
            .map(|(id, modes)| (id.clone(), PinState::new(*modes)))
            .collect();
        Self { digital, analog }
    }

    fn bank(&self, bank: Bank) -> &BTreeMap<PinId, PinState> {
        match bank {
            Bank::Digital => &self.digital,
            Bank::Analog => &self.analog,
        }
    }

    fn bank_mut(&mut self, bank: Bank) -> &mut BTreeMap<PinId, PinState> {
        match bank {
            Bank::Digital => &mut self.digital,
            Bank::Analog => &mut self.analog,
        }
    }

    pub fn get(&self, bank: Bank, pin: &PinId) -> Option<&PinState> {
        self.bank(bank).get(pin)
    }

    pub fn contains(&self, bank: Bank, pin: &PinId) -> bool {
        self.bank(bank).contains_key(pin)
    }

    /// Record `pin` as configured for `mode` and enabled. Returns `false`
    /// (and changes nothing) for an undiscovered pin.
    pub fn configure(&mut self, bank: Bank, pin: &PinId, mode: PinMode) -> bool {
        match self.bank_mut(bank).get_mut(pin) {
            Some(state) => {
                state.mode = mode;
                state.enabled = true;
                true
            }
            None => false,
        }
    }

    /// Mark `pin` disabled, keeping its mode.
    pub fn disable(&mut self, bank: Bank, pin: &PinId) -> bool {
        match self.bank_mut(bank).get_mut(pin) {
            Some(state) => {
                state.enabled = false;
                true
            }
            None => false,
        }
    }

    pub fn len(&self, bank: Bank) -> usize {
        self.bank(bank).len()
    }

    pub fn iter(&self, bank: Bank) -> impl Iterator<Item = (&PinId, &PinState)> {
        self.bank(bank).iter()
    }

    /// Enabled pins in `mode`, in pin order.
    pub fn enabled_in(&self, bank: Bank, mode: PinMode) -> Vec<PinId> {
        self.bank(bank)
            .iter()
            .filter(|(_, s)| s.enabled && s.mode == mode)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_set_membership() {
        let set = ModeSet::of(&[PinMode::Input, PinMode::Pwm]);
        assert!(set.contains(PinMode::Input));
        assert!(set.contains(PinMode::Pwm));
        assert!(!set.contains(PinMode::Servo));
        assert!(ModeSet::EMPTY.is_empty());
    }

    #[test]
    fn table_never_grows() {
        let caps = Capabilities {
            digital: vec![(PinId::Index(2), ModeSet::of(&[PinMode::Output]))],
            analog: Vec::new(),
            i2c: false,
        };
        let mut table = PinTable::from_capabilities(&caps);
        assert!(table.configure(Bank::Digital, &PinId::Index(2), PinMode::Output));
        assert!(!table.configure(Bank::Digital, &PinId::Index(3), PinMode::Output));
        assert!(!table.configure(Bank::Analog, &PinId::Index(2), PinMode::Analog));
        assert_eq!(table.len(Bank::Digital), 1);

        let state = table.get(Bank::Digital, &PinId::Index(2)).unwrap();
        assert_eq!(state.mode, PinMode::Output);
        assert!(state.enabled);
    }

    #[test]
    fn disable_keeps_mode() {
        let caps = Capabilities {
            digital: vec![(PinId::from("P9_12"), ModeSet::of(&[PinMode::Input]))],
            analog: Vec::new(),
            i2c: false,
        };
        let mut table = PinTable::from_capabilities(&caps);
        let pin = PinId::from("P9_12");
        table.configure(Bank::Digital, &pin, PinMode::Input);
        assert_eq!(table.enabled_in(Bank::Digital, PinMode::Input), vec![pin.clone()]);
        table.disable(Bank::Digital, &pin);
        let state = table.get(Bank::Digital, &pin).unwrap();
        assert_eq!(state.mode, PinMode::Input);
        assert!(!state.enabled);
        assert!(table.enabled_in(Bank::Digital, PinMode::Input).is_empty());
    }
}
