//! Book keys: interned currency codes plus asset class
//!
//! Currency codes are interned into a process-wide registry so a `Key` is a
//! small `Copy` value and equality is an integer comparison.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SyncError;

#[derive(Default)]
struct Registry {
    ids: HashMap<Arc<str>, u32>,
    names: Vec<Arc<str>>,
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Registry::default()))
}

/// Interned currency code handle (e.g. BTC, USDT)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Code(u32);

impl Code {
    /// Intern a currency code. Codes are case-insensitive and stored upper-case.
    pub fn new(symbol: &str) -> Self {
        let upper = symbol.trim().to_uppercase();

        if let Some(id) = registry().read().ids.get(upper.as_str()) {
            return Code(*id);
        }

        let mut reg = registry().write();
        // Another thread may have interned it between the two locks
        if let Some(id) = reg.ids.get(upper.as_str()) {
            return Code(*id);
        }
        let id = reg.names.len() as u32;
        let name: Arc<str> = Arc::from(upper);
        reg.names.push(name.clone());
        reg.ids.insert(name, id);
        Code(id)
    }

    /// The upper-case symbol this handle was interned from
    pub fn symbol(&self) -> Arc<str> {
        registry().read().names[self.0 as usize].clone()
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({})", self.symbol())
    }
}

/// Market type a book belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetClass {
    #[serde(rename = "spot")]
    Spot,
    #[serde(rename = "margin")]
    Margin,
    #[serde(rename = "perp-coin")]
    CoinMarginedPerpetual,
    #[serde(rename = "perp-linear")]
    LinearPerpetual,
}

impl AssetClass {
    pub const ALL: [AssetClass; 4] = [
        AssetClass::Spot,
        AssetClass::Margin,
        AssetClass::CoinMarginedPerpetual,
        AssetClass::LinearPerpetual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Spot => "spot",
            AssetClass::Margin => "margin",
            AssetClass::CoinMarginedPerpetual => "perp-coin",
            AssetClass::LinearPerpetual => "perp-linear",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssetClass::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SyncError::ConfigError(format!("unknown asset class: {}", s)))
    }
}

/// Identifies one synchronized book
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub base: Code,
    pub quote: Code,
    pub asset: AssetClass,
}

impl Key {
    pub fn new(base: Code, quote: Code, asset: AssetClass) -> Self {
        Self { base, quote, asset }
    }

    pub fn spot(base: &str, quote: &str) -> Self {
        Self::new(Code::new(base), Code::new(quote), AssetClass::Spot)
    }

    /// Symbol as the exchange names it on streams and REST endpoints
    pub fn exchange_symbol(&self) -> String {
        match self.asset {
            AssetClass::CoinMarginedPerpetual => format!("{}{}_PERP", self.base, self.quote),
            _ => format!("{}{}", self.base, self.quote),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}:{}", self.base, self.quote, self.asset)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl FromStr for Key {
    type Err = SyncError;

    /// Parses `BASE-QUOTE` or `BASE-QUOTE:asset`; the asset defaults to spot.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pair, asset) = match s.split_once(':') {
            Some((pair, asset)) => (pair, asset.parse()?),
            None => (s, AssetClass::Spot),
        };
        let (base, quote) = pair
            .split_once(['-', '/'])
            .ok_or_else(|| SyncError::ConfigError(format!("pair needs BASE-QUOTE form: {}", s)))?;
        if base.trim().is_empty() || quote.trim().is_empty() {
            return Err(SyncError::ConfigError(format!("empty currency code in {}", s)));
        }
        Ok(Key::new(Code::new(base), Code::new(quote), asset))
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
