// Chain tags and the coin catalog
//
// Two independent ledgers (golden and silver) share one closed catalog of
// coin kinds. Each kind has a fixed chain affinity, an optional mining
// difficulty multiplier, a cross-chain flag and an optional supply cap.
// The catalog is a pure static table; nothing here touches state.

use crate::primitives::codec::DecodeResult;

/// Minor units per whole coin.
pub const UNITS_PER_COIN: u64 = 100_000_000;

/// One of the two parallel chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChainTag {
    Golden,
    Silver,
}

impl ChainTag {
    pub const ALL: [ChainTag; 2] = [ChainTag::Golden, ChainTag::Silver];

    pub fn as_u8(self) -> u8 {
        match self {
            ChainTag::Golden => 0,
            ChainTag::Silver => 1,
        }
    }

    pub fn from_u8(v: u8) -> DecodeResult<Self> {
        match v {
            0 => Ok(ChainTag::Golden),
            1 => Ok(ChainTag::Silver),
            _ => Err("unknown chain tag"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChainTag::Golden => "golden",
            ChainTag::Silver => "silver",
        }
    }
}

impl std::fmt::Display for ChainTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which chains a coin kind may circulate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainAffinity {
    Golden,
    Silver,
    /// Valid on both chains and allowed to move between them (Antion).
    Both,
    /// Valid on both chains; each piece stays on the chain it was minted on.
    Free,
}

impl ChainAffinity {
    /// May a coin with this affinity appear in a block on `chain`?
    pub fn admits(self, chain: ChainTag) -> bool {
        match self {
            ChainAffinity::Golden => chain == ChainTag::Golden,
            ChainAffinity::Silver => chain == ChainTag::Silver,
            ChainAffinity::Both | ChainAffinity::Free => true,
        }
    }
}

/// Closed enumeration of coin kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinKind {
    // Mineable, chain-free
    Leah,
    Shiblum,
    Shiblon,
    // Golden chain denominations
    Senine,
    Seon,
    Shum,
    Limnah,
    // Cross-chain
    Antion,
    // Silver chain denominations
    Senum,
    Amnor,
    Ezrom,
    Onti,
    // Capped commemoratives
    Ephraim,
    Manasseh,
}

struct CoinTraits {
    affinity: ChainAffinity,
    /// Zero means not mineable.
    difficulty_multiplier: u64,
    cross_chain: bool,
    /// Cap in minor units; None = unbounded.
    supply_cap: Option<u64>,
}

const fn traits_of(kind: CoinKind) -> CoinTraits {
    match kind {
        CoinKind::Leah => CoinTraits {
            affinity: ChainAffinity::Free,
            difficulty_multiplier: 1,
            cross_chain: false,
            supply_cap: None,
        },
        CoinKind::Shiblum => CoinTraits {
            affinity: ChainAffinity::Free,
            difficulty_multiplier: 2,
            cross_chain: false,
            supply_cap: None,
        },
        CoinKind::Shiblon => CoinTraits {
            affinity: ChainAffinity::Free,
            difficulty_multiplier: 4,
            cross_chain: false,
            supply_cap: None,
        },
        CoinKind::Senine | CoinKind::Seon | CoinKind::Shum | CoinKind::Limnah => CoinTraits {
            affinity: ChainAffinity::Golden,
            difficulty_multiplier: 0,
            cross_chain: false,
            supply_cap: None,
        },
        CoinKind::Antion => CoinTraits {
            affinity: ChainAffinity::Both,
            difficulty_multiplier: 0,
            cross_chain: true,
            supply_cap: None,
        },
        CoinKind::Senum | CoinKind::Amnor | CoinKind::Ezrom | CoinKind::Onti => CoinTraits {
            affinity: ChainAffinity::Silver,
            difficulty_multiplier: 0,
            cross_chain: false,
            supply_cap: None,
        },
        CoinKind::Ephraim => CoinTraits {
            affinity: ChainAffinity::Golden,
            difficulty_multiplier: 0,
            cross_chain: false,
            supply_cap: Some(5_000_000 * UNITS_PER_COIN),
        },
        CoinKind::Manasseh => CoinTraits {
            affinity: ChainAffinity::Silver,
            difficulty_multiplier: 0,
            cross_chain: false,
            supply_cap: Some(5_000_000 * UNITS_PER_COIN),
        },
    }
}

impl CoinKind {
    pub const ALL: [CoinKind; 14] = [
        CoinKind::Leah,
        CoinKind::Shiblum,
        CoinKind::Shiblon,
        CoinKind::Senine,
        CoinKind::Seon,
        CoinKind::Shum,
        CoinKind::Limnah,
        CoinKind::Antion,
        CoinKind::Senum,
        CoinKind::Amnor,
        CoinKind::Ezrom,
        CoinKind::Onti,
        CoinKind::Ephraim,
        CoinKind::Manasseh,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            CoinKind::Leah => 0,
            CoinKind::Shiblum => 1,
            CoinKind::Shiblon => 2,
            CoinKind::Senine => 3,
            CoinKind::Seon => 4,
            CoinKind::Shum => 5,
            CoinKind::Limnah => 6,
            CoinKind::Antion => 7,
            CoinKind::Senum => 8,
            CoinKind::Amnor => 9,
            CoinKind::Ezrom => 10,
            CoinKind::Onti => 11,
            CoinKind::Ephraim => 12,
            CoinKind::Manasseh => 13,
        }
    }

    pub fn from_u8(v: u8) -> DecodeResult<Self> {
        CoinKind::ALL
            .get(v as usize)
            .copied()
            .ok_or("unknown coin kind")
    }

    pub fn name(self) -> &'static str {
        match self {
            CoinKind::Leah => "leah",
            CoinKind::Shiblum => "shiblum",
            CoinKind::Shiblon => "shiblon",
            CoinKind::Senine => "senine",
            CoinKind::Seon => "seon",
            CoinKind::Shum => "shum",
            CoinKind::Limnah => "limnah",
            CoinKind::Antion => "antion",
            CoinKind::Senum => "senum",
            CoinKind::Amnor => "amnor",
            CoinKind::Ezrom => "ezrom",
            CoinKind::Onti => "onti",
            CoinKind::Ephraim => "ephraim",
            CoinKind::Manasseh => "manasseh",
        }
    }

    pub fn chain_of(self) -> ChainAffinity {
        traits_of(self).affinity
    }

    pub fn is_mineable(self) -> bool {
        traits_of(self).difficulty_multiplier > 0
    }

    /// Difficulty multiplier for mining this kind. Panic-free: returns 1
    /// for non-mineable kinds so callers can divide targets unconditionally.
    pub fn mining_difficulty_multiplier(self) -> u64 {
        match traits_of(self).difficulty_multiplier {
            0 => 1,
            m => m,
        }
    }

    pub fn is_cross_chain(self) -> bool {
        traits_of(self).cross_chain
    }

    pub fn supply_cap(self) -> Option<u64> {
        traits_of(self).supply_cap
    }
}

impl std::fmt::Display for CoinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_three_kinds_are_mineable() {
        let mineable: Vec<CoinKind> = CoinKind::ALL
            .into_iter()
            .filter(|k| k.is_mineable())
            .collect();
        assert_eq!(
            mineable,
            vec![CoinKind::Leah, CoinKind::Shiblum, CoinKind::Shiblon]
        );
    }

    #[test]
    fn test_difficulty_multipliers() {
        assert_eq!(CoinKind::Leah.mining_difficulty_multiplier(), 1);
        assert_eq!(CoinKind::Shiblum.mining_difficulty_multiplier(), 2);
        assert_eq!(CoinKind::Shiblon.mining_difficulty_multiplier(), 4);
        // Non-mineable kinds divide by one
        assert_eq!(CoinKind::Onti.mining_difficulty_multiplier(), 1);
    }

    #[test]
    fn test_antion_is_the_only_cross_chain_kind() {
        for kind in CoinKind::ALL {
            assert_eq!(kind.is_cross_chain(), kind == CoinKind::Antion);
        }
    }

    #[test]
    fn test_caps() {
        assert!(CoinKind::Ephraim.supply_cap().is_some());
        assert!(CoinKind::Manasseh.supply_cap().is_some());
        let capped = CoinKind::ALL
            .into_iter()
            .filter(|k| k.supply_cap().is_some())
            .count();
        assert_eq!(capped, 2);
    }

    #[test]
    fn test_affinity_admission() {
        assert!(CoinKind::Senine.chain_of().admits(ChainTag::Golden));
        assert!(!CoinKind::Senine.chain_of().admits(ChainTag::Silver));
        assert!(CoinKind::Onti.chain_of().admits(ChainTag::Silver));
        assert!(CoinKind::Antion.chain_of().admits(ChainTag::Golden));
        assert!(CoinKind::Antion.chain_of().admits(ChainTag::Silver));
        assert!(CoinKind::Leah.chain_of().admits(ChainTag::Golden));
        assert!(CoinKind::Leah.chain_of().admits(ChainTag::Silver));
    }

    #[test]
    fn test_wire_byte_roundtrip() {
        for kind in CoinKind::ALL {
            assert_eq!(CoinKind::from_u8(kind.as_u8()).unwrap(), kind);
        }
        assert!(CoinKind::from_u8(14).is_err());
        for tag in ChainTag::ALL {
            assert_eq!(ChainTag::from_u8(tag.as_u8()).unwrap(), tag);
        }
        assert!(ChainTag::from_u8(2).is_err());
    }
}
