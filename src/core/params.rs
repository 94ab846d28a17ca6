use serde::{Deserialize, Serialize};

use super::error::SimulationError;
use super::types::{Asset, CapitalMarketAssumptions, ASSET_COUNT};

/// Kou jump process parameters for one asset, in log-return scale.
/// `eta_pos`/`eta_neg` are the means of the exponential jump sizes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KouParams {
    pub lam: f64,
    pub p_pos: f64,
    pub eta_pos: f64,
    pub eta_neg: f64,
}

impl KouParams {
    pub const fn new(lam: f64, p_pos: f64, eta_pos: f64, eta_neg: f64) -> Self {
        KouParams {
            lam,
            p_pos,
            eta_pos,
            eta_neg,
        }
    }
}

/// Market-wide co-jump shared by the affected assets, with a fraction
/// bleeding into bonds (flight-to-quality).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketJumpParams {
    pub lam: f64,
    pub p_pos: f64,
    pub eta_pos: f64,
    pub eta_neg: f64,
    pub affected_assets: Vec<Asset>,
    pub bond_beta: f64,
}

impl Default for MarketJumpParams {
    fn default() -> Self {
        MarketJumpParams {
            lam: 0.25,
            p_pos: 0.40,
            eta_pos: 0.055,
            eta_neg: 0.075,
            affected_assets: vec![Asset::Stocks, Asset::Crypto],
            bond_beta: 0.10,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailMagnitude {
    Standard,
    Extreme,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailFrequency {
    Standard,
    High,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailSkew {
    Negative,
    Neutral,
    Positive,
}

/// Baseline per-asset Kou calibration (U.S. history, log scale).
pub const DEFAULT_PER_ASSET: [KouParams; ASSET_COUNT] = [
    KouParams::new(0.20, 0.40, 0.030, 0.075), // stocks
    KouParams::new(0.03, 0.50, 0.006, 0.012), // bonds
    KouParams::new(0.90, 0.45, 0.140, 0.170), // crypto
    KouParams::new(0.00, 0.50, 0.000, 0.000), // cds
    KouParams::new(0.00, 0.50, 0.000, 0.000), // cash
];

/// Hard annual floors in arithmetic space, per asset.
pub const STANDARD_FLOORS: [f64; ASSET_COUNT] = [-0.60, -0.25, -0.85, -0.05, -0.02];
pub const EXTREME_FLOORS: [f64; ASSET_COUNT] = [-0.70, -0.25, -0.85, -0.05, -0.02];

/// When the black swan feature is on, the market jump's negative tail is
/// trimmed to this mean so the two features do not double-count crashes.
const BLACK_SWAN_MARKET_ETA_NEG: f64 = 0.070;

/// Idiosyncratic intensities above one jump per year on average produce
/// unrealistic cascades; toggled values are clamped here.
const MAX_IDIO_LAM: f64 = 1.0;

const EXTREME_MAGNITUDE_SCALE: f64 = 1.30;
const HIGH_FREQUENCY_SCALE: f64 = 1.50;
const HIGH_FREQUENCY_MARKET_ETA_NEG_SCALE: f64 = 1.10;
const SKEW_P_SHIFT: f64 = 0.05;

/// Complete fat-tail configuration for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct FatTailParams {
    pub enabled: bool,
    pub t_df: f64,
    pub magnitude: TailMagnitude,
    pub frequency: TailFrequency,
    pub skew: TailSkew,
    pub black_swan_active: bool,
    pub per_asset: [KouParams; ASSET_COUNT],
    pub market: MarketJumpParams,
}

impl Default for FatTailParams {
    fn default() -> Self {
        FatTailParams {
            enabled: true,
            t_df: 8.0,
            magnitude: TailMagnitude::Standard,
            frequency: TailFrequency::Standard,
            skew: TailSkew::Neutral,
            black_swan_active: false,
            per_asset: DEFAULT_PER_ASSET,
            market: MarketJumpParams::default(),
        }
    }
}

/// Toggle-adjusted jump parameters, always a fresh copy of the baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustedJumps {
    pub per_asset: [KouParams; ASSET_COUNT],
    pub market: MarketJumpParams,
}

impl FatTailParams {
    /// Derive the toggle settings from a scenario's capital market
    /// assumptions: low degrees of freedom read as the extreme-magnitude
    /// preset, an elevated annual tail probability as the high-frequency
    /// preset, and a boost above one tilts the jump mix negative.
    pub fn from_cma(cma: &CapitalMarketAssumptions, black_swan_active: bool) -> Self {
        let magnitude = if cma.t_df <= 5.0 {
            TailMagnitude::Extreme
        } else {
            TailMagnitude::Standard
        };
        let frequency = if cma.tail_prob >= 0.04 {
            TailFrequency::High
        } else {
            TailFrequency::Standard
        };
        let skew = if cma.tail_boost >= 1.1 {
            TailSkew::Negative
        } else if cma.tail_boost <= 0.9 {
            TailSkew::Positive
        } else {
            TailSkew::Neutral
        };

        FatTailParams {
            enabled: cma.fat_tails,
            t_df: cma.t_df,
            magnitude,
            frequency,
            skew,
            black_swan_active,
            ..FatTailParams::default()
        }
    }

    pub fn with_pack(mut self, pack: &ParamPack) -> Self {
        self.per_asset = pack.per_asset();
        self.market = pack.market.clone();
        self
    }

    pub fn floors(&self) -> [f64; ASSET_COUNT] {
        match self.magnitude {
            TailMagnitude::Standard => STANDARD_FLOORS,
            TailMagnitude::Extreme => EXTREME_FLOORS,
        }
    }

    /// Apply the toggle multipliers. Returns adjusted copies; `self` is
    /// never mutated, so repeated calls with the same toggles are
    /// identical.
    pub fn adjusted(&self) -> AdjustedJumps {
        let mag = match self.magnitude {
            TailMagnitude::Extreme => EXTREME_MAGNITUDE_SCALE,
            TailMagnitude::Standard => 1.0,
        };
        let freq = match self.frequency {
            TailFrequency::High => HIGH_FREQUENCY_SCALE,
            TailFrequency::Standard => 1.0,
        };
        let market_freq_eta_neg = match self.frequency {
            TailFrequency::High => HIGH_FREQUENCY_MARKET_ETA_NEG_SCALE,
            TailFrequency::Standard => 1.0,
        };
        let (p_shift, eta_pos_scale, eta_neg_scale) = match self.skew {
            TailSkew::Negative => (-SKEW_P_SHIFT, 0.95, 1.10),
            TailSkew::Neutral => (0.0, 1.0, 1.0),
            TailSkew::Positive => (SKEW_P_SHIFT, 0.95, 0.95),
        };

        let mut per_asset = self.per_asset;
        for p in &mut per_asset {
            p.lam = (p.lam * freq).min(MAX_IDIO_LAM);
            p.p_pos = (p.p_pos + p_shift).clamp(0.05, 0.95);
            p.eta_pos *= mag * eta_pos_scale;
            p.eta_neg *= mag * eta_neg_scale;
        }

        let base = &self.market;
        let market_eta_neg_base = if self.black_swan_active {
            base.eta_neg.min(BLACK_SWAN_MARKET_ETA_NEG)
        } else {
            base.eta_neg
        };
        let market = MarketJumpParams {
            lam: base.lam * freq,
            p_pos: (base.p_pos + p_shift).clamp(0.05, 0.95),
            eta_pos: base.eta_pos * mag * eta_pos_scale,
            eta_neg: market_eta_neg_base * mag * market_freq_eta_neg * eta_neg_scale,
            affected_assets: base.affected_assets.clone(),
            bond_beta: base.bond_beta,
        };

        AdjustedJumps { per_asset, market }
    }
}

/// Versioned on-disk calibration document. Unknown fields are tolerated so
/// newer files load on older builds; missing fields are an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamPack {
    pub version: String,
    pub t_df: f64,
    pub stocks: KouParams,
    pub bonds: KouParams,
    pub crypto: KouParams,
    pub cds: KouParams,
    pub cash: KouParams,
    pub market: MarketJumpParams,
}

pub const PARAM_PACK_VERSION: &str = "kou_params_v1";

impl Default for ParamPack {
    fn default() -> Self {
        ParamPack {
            version: PARAM_PACK_VERSION.to_string(),
            t_df: 8.0,
            stocks: DEFAULT_PER_ASSET[0],
            bonds: DEFAULT_PER_ASSET[1],
            crypto: DEFAULT_PER_ASSET[2],
            cds: DEFAULT_PER_ASSET[3],
            cash: DEFAULT_PER_ASSET[4],
            market: MarketJumpParams::default(),
        }
    }
}

impl ParamPack {
    pub fn per_asset(&self) -> [KouParams; ASSET_COUNT] {
        [self.stocks, self.bonds, self.crypto, self.cds, self.cash]
    }

    pub fn from_json(json: &str) -> Result<Self, SimulationError> {
        let pack: ParamPack = serde_json::from_str(json)
            .map_err(|e| SimulationError::validation(format!("invalid parameter pack: {e}")))?;
        if pack.version != PARAM_PACK_VERSION {
            return Err(SimulationError::validation(format!(
                "unsupported parameter pack version {:?}, expected {PARAM_PACK_VERSION:?}",
                pack.version
            )));
        }
        pack.validate()?;
        Ok(pack)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("parameter pack serializes")
    }

    pub fn load(path: &std::path::Path) -> Result<Self, SimulationError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SimulationError::validation(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<(), SimulationError> {
        for (asset, p) in Asset::ALL.iter().zip(self.per_asset()) {
            validate_kou(asset.name(), &p)?;
        }
        let market = KouParams::new(
            self.market.lam,
            self.market.p_pos,
            self.market.eta_pos,
            self.market.eta_neg,
        );
        validate_kou("market", &market)?;
        if !self.market.bond_beta.is_finite() || !(0.0..=1.0).contains(&self.market.bond_beta) {
            return Err(SimulationError::validation("market bondBeta must be in [0, 1]"));
        }
        if !self.t_df.is_finite() || self.t_df < 3.0 {
            return Err(SimulationError::validation("tDf must be >= 3"));
        }
        Ok(())
    }
}

fn validate_kou(name: &str, p: &KouParams) -> Result<(), SimulationError> {
    if !p.lam.is_finite() || p.lam < 0.0 {
        return Err(SimulationError::validation(format!(
            "{name} lam must be >= 0"
        )));
    }
    if !p.p_pos.is_finite() || !(0.0..=1.0).contains(&p.p_pos) {
        return Err(SimulationError::validation(format!(
            "{name} pPos must be in [0, 1]"
        )));
    }
    if !p.eta_pos.is_finite() || p.eta_pos < 0.0 || !p.eta_neg.is_finite() || p.eta_neg < 0.0 {
        return Err(SimulationError::validation(format!(
            "{name} jump size means must be >= 0"
        )));
    }
    Ok(())
}
