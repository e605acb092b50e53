//! Per-component `Kind` flags.
//!
//! `Kind` controls which read/describe call surfaces a signal or sub-device:
//! `NORMAL` components appear in `read()`/`describe()`, `CONFIG` components in
//! `read_configuration()`/`describe_configuration()`, and `HINTED` is a
//! `NORMAL` refinement marking the handful of fields a live table should show.
//! An empty set (`OMITTED`) hides the component from both views without
//! removing it from the object tree.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flag set deciding which read/describe view a component appears in.
    ///
    /// `HINTED` contains the `NORMAL` bit, so `kind.normal()` is true for
    /// hinted components too.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Kind: u8 {
        /// Include in `read()` / `describe()`.
        const NORMAL = 0b001;
        /// Include in `read_configuration()` / `describe_configuration()`.
        const CONFIG = 0b010;
        /// A `NORMAL` component that downstream consumers should surface
        /// prominently. Hinted implies normal.
        const HINTED = 0b101;
    }
}

impl Kind {
    /// The empty set: present in the object tree, absent from every view.
    pub const OMITTED: Kind = Kind::empty();

    /// Whether this component participates in `read()`.
    pub fn normal(self) -> bool {
        self.contains(Kind::NORMAL)
    }

    /// Whether this component participates in `read_configuration()`.
    pub fn config(self) -> bool {
        self.contains(Kind::CONFIG)
    }

    /// Whether this component carries the hinted refinement.
    pub fn hinted(self) -> bool {
        self.contains(Kind::HINTED)
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::NORMAL
    }
}
