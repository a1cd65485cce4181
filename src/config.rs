use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Position of a cache in the hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum CacheLevel {
    /// first level, write-through / no-write-allocate
    FIRSTLEVEL_WT,
    /// first level, write-back / write-allocate
    FIRSTLEVEL_WB,
    /// second level (always write-back)
    SECONDLEVEL,
}

/// Coherence flavor of a cache, selecting its transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum CoheKind {
    PR_WT,
    PR_WB,
    WB_NREF,
    /// not cacheable
    NC,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Replacement {
    LRU,
    FIFO,
    RANDOM,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum ReplacementHints {
    NONE,
    EXCL,
    ALL,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    MESI,
    MSI,
}

/// Cache capacity: kilobytes, or unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheSize {
    #[serde(rename = "kb")]
    Kb(u32),
    Infinite,
}

/// Set associativity: a power-of-two way count, or fully associative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Associativity {
    Ways(u32),
    Full,
}

/// One tag- or data-array pipeline bank group: a common depth (access
/// latency) and one width per bank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeSpec {
    pub delay: usize,
    pub widths: Vec<usize>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("line size {0} is not a power of two at least a word (4)")]
    BadLineSize(u32),
    #[error("set size {0} is not a power of two")]
    BadSetSize(u32),
    #[error("line size {line} does not divide cache size {kb} KB")]
    SizeNotMultiple { kb: u32, line: u32 },
    #[error("associativity {ways} exceeds {lines} lines")]
    TooAssociative { ways: u32, lines: u32 },
    #[error("cache needs at least one MSHR")]
    NoMshrs,
    #[error("{0} pipe spec needs at least one bank")]
    NoPipes(&'static str),
}

/// Per-cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub level: CacheLevel,
    pub size: CacheSize,
    pub line_size: u32,
    pub assoc: Associativity,
    pub replacement: Replacement,
    pub cohe_kind: CoheKind,
    pub max_mshrs: usize,
    /// maximum requests coalesced into one MSHR or write-buffer entry
    pub max_coals: usize,
    pub tag_pipes: PipeSpec,
    /// L2 only; L1 caches leave this empty
    pub data_pipes: PipeSpec,
    /// extra WRB-buffer slots beyond one per MSHR (L2 only)
    pub wrb_buf_extra: usize,
    pub replacement_hints: ReplacementHints,
    pub protocol: Protocol,
    pub discriminate_prefetch: bool,
    /// entries in the write buffer (write-through L1 only)
    pub wbuf_size: usize,
}

impl CacheConfig {
    /// Default two-ported write-back L1.
    #[must_use]
    pub fn default_l1() -> Self {
        Self {
            level: CacheLevel::FIRSTLEVEL_WB,
            size: CacheSize::Kb(16),
            line_size: 64,
            assoc: Associativity::Ways(2),
            replacement: Replacement::LRU,
            cohe_kind: CoheKind::PR_WB,
            max_mshrs: 8,
            max_coals: 16,
            tag_pipes: PipeSpec {
                delay: 1,
                widths: vec![2, 1, 1],
            },
            data_pipes: PipeSpec {
                delay: 0,
                widths: vec![],
            },
            wrb_buf_extra: 0,
            replacement_hints: ReplacementHints::EXCL,
            protocol: Protocol::MESI,
            discriminate_prefetch: false,
            wbuf_size: 8,
        }
    }

    /// Default single-ported write-back L2 with split tag/data arrays.
    #[must_use]
    pub fn default_l2() -> Self {
        Self {
            level: CacheLevel::SECONDLEVEL,
            size: CacheSize::Kb(64),
            line_size: 64,
            assoc: Associativity::Ways(4),
            replacement: Replacement::LRU,
            cohe_kind: CoheKind::WB_NREF,
            max_mshrs: 8,
            max_coals: 16,
            tag_pipes: PipeSpec {
                delay: 3,
                widths: vec![1, 1, 1],
            },
            data_pipes: PipeSpec {
                delay: 5,
                widths: vec![1],
            },
            wrb_buf_extra: 0,
            replacement_hints: ReplacementHints::EXCL,
            protocol: Protocol::MESI,
            discriminate_prefetch: false,
            wbuf_size: 0,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.line_size < 4 || !self.line_size.is_power_of_two() {
            return Err(ConfigError::BadLineSize(self.line_size));
        }
        if let Associativity::Ways(ways) = self.assoc {
            if !ways.is_power_of_two() {
                return Err(ConfigError::BadSetSize(ways));
            }
            if let CacheSize::Kb(kb) = self.size {
                if (kb * 1024) % self.line_size != 0 {
                    return Err(ConfigError::SizeNotMultiple {
                        kb,
                        line: self.line_size,
                    });
                }
                let lines = kb * 1024 / self.line_size;
                if ways > lines {
                    return Err(ConfigError::TooAssociative { ways, lines });
                }
            }
        }
        if self.max_mshrs == 0 {
            return Err(ConfigError::NoMshrs);
        }
        if self.tag_pipes.widths.is_empty() || self.tag_pipes.delay == 0 {
            return Err(ConfigError::NoPipes("tag"));
        }
        if self.level == CacheLevel::SECONDLEVEL
            && (self.data_pipes.widths.is_empty() || self.data_pipes.delay == 0)
        {
            return Err(ConfigError::NoPipes("data"));
        }
        Ok(())
    }

    /// Initial line count. Infinite caches start with one growth chunk and
    /// extend on demand.
    #[must_use]
    pub fn num_lines(&self) -> usize {
        match self.size {
            CacheSize::Kb(kb) => (kb as usize * 1024) / self.line_size as usize,
            CacheSize::Infinite => crate::cache::INFINITE_CHUNK,
        }
    }

    /// Ways per set (infinite caches are fully associative).
    #[must_use]
    pub fn set_size(&self) -> usize {
        match (self.size, self.assoc) {
            (CacheSize::Infinite, _) | (_, Associativity::Full) => self.num_lines(),
            (_, Associativity::Ways(w)) => w as usize,
        }
    }

    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.num_lines() / self.set_size()
    }

    #[must_use]
    pub fn block_bits(&self) -> u32 {
        self.line_size.trailing_zeros()
    }

    #[must_use]
    pub fn set_bits(&self) -> u32 {
        (self.num_sets() as u64).trailing_zeros()
    }

    /// Cache line number of an address.
    #[must_use]
    pub fn tag_of(&self, address: crate::address) -> u64 {
        address >> self.block_bits()
    }

    #[must_use]
    pub fn set_of(&self, tag: u64) -> usize {
        (tag as usize) & (self.num_sets() - 1)
    }

    #[must_use]
    pub fn is_infinite(&self) -> bool {
        self.size == CacheSize::Infinite
    }

    /// Total WRB-buffer slots at the L2.
    #[must_use]
    pub fn wrb_buf_size(&self) -> usize {
        self.max_mshrs + self.wrb_buf_extra
    }
}

/// Configuration of one node's hierarchy plus the machine-level knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hierarchy {
    pub num_nodes: usize,
    pub l1: CacheConfig,
    pub l2: CacheConfig,
    /// capacity of each inter-module port
    pub port_size: usize,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self {
            num_nodes: 1,
            l1: CacheConfig::default_l1(),
            l2: CacheConfig::default_l2(),
            port_size: 8,
        }
    }
}

impl Hierarchy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.l1.validate()?;
        self.l2.validate()?;
        Ok(())
    }

    /// Home node of a physical address (block-interleaved). The real
    /// address-to-node map is owned by the surrounding simulator; this is the
    /// driver's default.
    #[must_use]
    pub fn home_node(&self, address: crate::address) -> usize {
        ((address >> self.l2.block_bits()) % self.num_nodes as u64) as usize
    }
}

pub type HierarchyRef = Arc<Hierarchy>;

#[cfg(test)]
mod tests {
    use super::{Associativity, CacheConfig, CacheSize, ConfigError};

    #[test]
    fn default_geometry() {
        let l1 = CacheConfig::default_l1();
        assert_eq!(l1.num_lines(), 256);
        assert_eq!(l1.set_size(), 2);
        assert_eq!(l1.num_sets(), 128);
        assert_eq!(l1.block_bits(), 6);
        assert_eq!(l1.tag_of(0x1040), 0x41);
        assert_eq!(l1.set_of(l1.tag_of(0x1040)), 0x41);
    }

    #[test]
    fn rejects_non_power_of_two_line() {
        let mut cfg = CacheConfig::default_l1();
        cfg.line_size = 48;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadLineSize(48))
        ));
    }

    #[test]
    fn full_associativity_is_one_set() {
        let mut cfg = CacheConfig::default_l1();
        cfg.assoc = Associativity::Full;
        assert_eq!(cfg.num_sets(), 1);
        assert_eq!(cfg.set_size(), cfg.num_lines());
    }

    #[test]
    fn infinite_cache_starts_with_chunk() {
        let mut cfg = CacheConfig::default_l1();
        cfg.size = CacheSize::Infinite;
        assert_eq!(cfg.num_lines(), crate::cache::INFINITE_CHUNK);
        assert_eq!(cfg.num_sets(), 1);
    }
}
