use serde::{Deserialize, Serialize};

use super::error::SimulationError;

pub const ASSET_COUNT: usize = 5;

/// Fixed asset universe. All per-asset vectors and matrices in the engine
/// index assets in this order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    Stocks,
    Bonds,
    Crypto,
    Cds,
    Cash,
}

impl Asset {
    pub const ALL: [Asset; ASSET_COUNT] = [
        Asset::Stocks,
        Asset::Bonds,
        Asset::Crypto,
        Asset::Cds,
        Asset::Cash,
    ];

    pub fn index(self) -> usize {
        match self {
            Asset::Stocks => 0,
            Asset::Bonds => 1,
            Asset::Crypto => 2,
            Asset::Cds => 3,
            Asset::Cash => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Asset::Stocks => "stocks",
            Asset::Bonds => "bonds",
            Asset::Crypto => "crypto",
            Asset::Cds => "cds",
            Asset::Cash => "cash",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    pub kind: String,
    pub balance: f64,
    pub stocks: f64,
    pub bonds: f64,
    pub crypto: f64,
    pub cds: f64,
    pub cash: f64,
}

impl Account {
    pub fn weights(&self) -> [f64; ASSET_COUNT] {
        [self.stocks, self.bonds, self.crypto, self.cds, self.cash]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Spending {
    pub base_annual: f64,
    pub reduced_annual: f64,
    pub reduce_at_age: u32,
    pub inflation: f64,
}

impl Default for Spending {
    fn default() -> Self {
        Spending {
            base_annual: 100_000.0,
            reduced_annual: 70_000.0,
            reduce_at_age: 57,
            inflation: 0.02,
        }
    }
}

/// Recurring income stream (Social Security, pension, rental, ...), stated
/// monthly and grown by its COLA from the year it starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeStream {
    pub start_age: u32,
    pub end_age: u32,
    pub monthly: f64,
    #[serde(default = "default_cola")]
    pub cola: f64,
}

fn default_cola() -> f64 {
    0.02
}

/// One-time cash inflow (inheritance, home sale, ...), applied at the start
/// of the year of `age`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LumpEvent {
    pub age: u32,
    pub amount: f64,
    #[serde(default)]
    pub description: String,
}

/// One-time purchase (car, boat, big trip), treated as extra spending in
/// the year of `age`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToyPurchase {
    pub age: u32,
    pub amount: f64,
    #[serde(default)]
    pub description: String,
}

/// Part-time consulting ladder: active income that compounds at `growth`
/// for `years` years starting at `start_age`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsultingLadder {
    pub start_age: u32,
    pub years: u32,
    pub start_amount: f64,
    pub growth: f64,
}

impl Default for ConsultingLadder {
    fn default() -> Self {
        ConsultingLadder {
            start_age: 55,
            years: 5,
            start_amount: 25_000.0,
            growth: 0.10,
        }
    }
}

/// Single effective-rate tax model. Withdrawal needs are grossed up by the
/// taxable share of portfolio draws; income is taxed on its taxable share.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Taxes {
    pub effective_rate: f64,
    pub taxable_portfolio_ratio: f64,
    pub taxable_income_ratio: f64,
}

impl Default for Taxes {
    fn default() -> Self {
        Taxes {
            effective_rate: 0.20,
            taxable_portfolio_ratio: 0.75,
            taxable_income_ratio: 0.80,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlackSwan {
    pub enabled: bool,
    pub age: u32,
    pub portfolio_drop: f64,
}

impl Default for BlackSwan {
    fn default() -> Self {
        BlackSwan {
            enabled: false,
            age: 67,
            portfolio_drop: 0.25,
        }
    }
}

/// Expected returns, volatilities and correlations per asset class, plus
/// the fat-tail knobs. Vols are arithmetic annual figures; the return
/// generator converts them to log scale before factorizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapitalMarketAssumptions {
    pub exp_ret: [f64; ASSET_COUNT],
    pub vol: [f64; ASSET_COUNT],
    pub corr: [[f64; ASSET_COUNT]; ASSET_COUNT],
    pub fat_tails: bool,
    pub t_df: f64,
    pub tail_prob: f64,
    pub tail_boost: f64,
}

impl Default for CapitalMarketAssumptions {
    fn default() -> Self {
        CapitalMarketAssumptions {
            exp_ret: [0.08, 0.045, 0.20, 0.04, 0.03],
            vol: [0.17, 0.07, 0.80, 0.02, 0.01],
            corr: [
                [1.0, 0.2, 0.5, -0.1, -0.2],
                [0.2, 1.0, 0.1, 0.3, 0.2],
                [0.5, 0.1, 1.0, 0.0, -0.1],
                [-0.1, 0.3, 0.0, 1.0, 0.4],
                [-0.2, 0.2, -0.1, 0.4, 1.0],
            ],
            fat_tails: true,
            t_df: 8.0,
            tail_prob: 0.025,
            tail_boost: 1.0,
        }
    }
}

/// Complete retirement scenario. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scenario {
    pub name: String,
    pub current_age: u32,
    pub end_age: u32,
    pub n_sims: u32,
    pub accounts: Vec<Account>,
    pub cma: CapitalMarketAssumptions,
    pub taxes: Taxes,
    pub spending: Spending,
    pub consulting: ConsultingLadder,
    pub incomes: Vec<IncomeStream>,
    pub lumps: Vec<LumpEvent>,
    pub toys: Vec<ToyPurchase>,
    pub black_swan: BlackSwan,
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario {
            name: "Base".to_string(),
            current_age: 55,
            end_age: 90,
            n_sims: 10_000,
            accounts: vec![
                Account {
                    kind: "401k".to_string(),
                    balance: 1_200_000.0,
                    stocks: 0.60,
                    bonds: 0.35,
                    cash: 0.05,
                    ..Account::default()
                },
                Account {
                    kind: "Taxable".to_string(),
                    balance: 300_000.0,
                    stocks: 0.50,
                    bonds: 0.20,
                    crypto: 0.05,
                    cds: 0.15,
                    cash: 0.10,
                    ..Account::default()
                },
            ],
            cma: CapitalMarketAssumptions::default(),
            taxes: Taxes::default(),
            spending: Spending::default(),
            consulting: ConsultingLadder::default(),
            incomes: Vec::new(),
            lumps: Vec::new(),
            toys: Vec::new(),
            black_swan: BlackSwan::default(),
        }
    }
}

pub const MAX_SIMULATIONS: u32 = 100_000;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

impl Scenario {
    pub fn n_years(&self) -> usize {
        (self.end_age - self.current_age) as usize
    }

    pub fn initial_balance(&self) -> f64 {
        self.accounts.iter().map(|a| a.balance).sum()
    }

    /// Balance-weighted aggregate asset weights across all accounts,
    /// renormalized to sum to one.
    pub fn target_weights(&self) -> Result<[f64; ASSET_COUNT], SimulationError> {
        let total = self.initial_balance();
        if total <= 0.0 {
            return Err(SimulationError::validation(
                "total account balance must be > 0",
            ));
        }

        let mut weights = [0.0; ASSET_COUNT];
        for account in &self.accounts {
            let share = account.balance / total;
            for (w, aw) in weights.iter_mut().zip(account.weights()) {
                *w += share * aw;
            }
        }

        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 {
            return Err(SimulationError::validation(
                "aggregate asset weights must be > 0",
            ));
        }
        for w in &mut weights {
            *w /= sum;
        }
        Ok(weights)
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.end_age < self.current_age {
            return Err(SimulationError::validation(format!(
                "endAge {} must be >= currentAge {}",
                self.end_age, self.current_age
            )));
        }
        if self.n_sims == 0 || self.n_sims > MAX_SIMULATIONS {
            return Err(SimulationError::validation(format!(
                "nSims must be in 1..={MAX_SIMULATIONS}"
            )));
        }
        if self.accounts.is_empty() {
            return Err(SimulationError::validation(
                "at least one account is required",
            ));
        }

        for (i, account) in self.accounts.iter().enumerate() {
            if !account.balance.is_finite() || account.balance < 0.0 {
                return Err(SimulationError::validation(format!(
                    "account {i} balance must be >= 0"
                )));
            }
            let mut sum = 0.0;
            for (asset, w) in Asset::ALL.iter().zip(account.weights()) {
                if !w.is_finite() || !(0.0..=1.0).contains(&w) {
                    return Err(SimulationError::validation(format!(
                        "account {i} {} weight must be in [0, 1]",
                        asset.name()
                    )));
                }
                sum += w;
            }
            if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
                return Err(SimulationError::validation(format!(
                    "account {i} weights sum to {sum}, expected 1"
                )));
            }
        }
        if self.initial_balance() <= 0.0 {
            return Err(SimulationError::validation(
                "total account balance must be > 0",
            ));
        }

        self.validate_cma()?;
        self.validate_cashflows()?;

        if !self.black_swan.portfolio_drop.is_finite()
            || !(0.0..=1.0).contains(&self.black_swan.portfolio_drop)
        {
            return Err(SimulationError::validation(
                "blackSwan portfolioDrop must be in [0, 1]",
            ));
        }

        Ok(())
    }

    fn validate_cma(&self) -> Result<(), SimulationError> {
        let cma = &self.cma;
        for (asset, mu) in Asset::ALL.iter().zip(cma.exp_ret) {
            if !mu.is_finite() || mu <= -1.0 {
                return Err(SimulationError::validation(format!(
                    "{} expected return must be > -1",
                    asset.name()
                )));
            }
        }
        for (asset, vol) in Asset::ALL.iter().zip(cma.vol) {
            if !vol.is_finite() || vol < 0.0 {
                return Err(SimulationError::validation(format!(
                    "{} volatility must be >= 0",
                    asset.name()
                )));
            }
        }
        for i in 0..ASSET_COUNT {
            if (cma.corr[i][i] - 1.0).abs() > 1e-9 {
                return Err(SimulationError::validation(
                    "correlation matrix must have a unit diagonal",
                ));
            }
            for j in 0..ASSET_COUNT {
                let c = cma.corr[i][j];
                if !c.is_finite() || !(-1.0..=1.0).contains(&c) {
                    return Err(SimulationError::validation(
                        "correlation entries must be in [-1, 1]",
                    ));
                }
                if (c - cma.corr[j][i]).abs() > 1e-9 {
                    return Err(SimulationError::validation(
                        "correlation matrix must be symmetric",
                    ));
                }
            }
        }
        if super::returns::cholesky(&cma.corr).is_err() {
            return Err(SimulationError::validation(
                "correlation matrix is not positive semi-definite",
            ));
        }
        if !cma.t_df.is_finite() || !(3.0..=20.0).contains(&cma.t_df) {
            return Err(SimulationError::validation("tDf must be in [3, 20]"));
        }
        if !cma.tail_prob.is_finite() || !(0.0..=1.0).contains(&cma.tail_prob) {
            return Err(SimulationError::validation("tailProb must be in [0, 1]"));
        }
        if !cma.tail_boost.is_finite() || !(0.7..=1.3).contains(&cma.tail_boost) {
            return Err(SimulationError::validation(
                "tailBoost must be in [0.7, 1.3]",
            ));
        }
        Ok(())
    }

    fn validate_cashflows(&self) -> Result<(), SimulationError> {
        let spending = &self.spending;
        for (name, v) in [
            ("spending baseAnnual", spending.base_annual),
            ("spending reducedAnnual", spending.reduced_annual),
            ("spending inflation", spending.inflation),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(SimulationError::validation(format!("{name} must be >= 0")));
            }
        }

        for (i, stream) in self.incomes.iter().enumerate() {
            if stream.end_age < stream.start_age {
                return Err(SimulationError::validation(format!(
                    "income {i} endAge must be >= startAge"
                )));
            }
            if !stream.monthly.is_finite() || stream.monthly < 0.0 {
                return Err(SimulationError::validation(format!(
                    "income {i} monthly must be >= 0"
                )));
            }
            if !stream.cola.is_finite() || stream.cola <= -1.0 {
                return Err(SimulationError::validation(format!(
                    "income {i} cola must be > -1"
                )));
            }
        }
        for (i, lump) in self.lumps.iter().enumerate() {
            if !lump.amount.is_finite() || lump.amount < 0.0 {
                return Err(SimulationError::validation(format!(
                    "lump {i} amount must be >= 0"
                )));
            }
        }
        for (i, toy) in self.toys.iter().enumerate() {
            if !toy.amount.is_finite() || toy.amount < 0.0 {
                return Err(SimulationError::validation(format!(
                    "toy {i} amount must be >= 0"
                )));
            }
        }
        if !self.consulting.start_amount.is_finite() || self.consulting.start_amount < 0.0 {
            return Err(SimulationError::validation(
                "consulting startAmount must be >= 0",
            ));
        }
        if !self.consulting.growth.is_finite() || self.consulting.growth <= -1.0 {
            return Err(SimulationError::validation("consulting growth must be > -1"));
        }

        let taxes = &self.taxes;
        for (name, v) in [
            ("taxes effectiveRate", taxes.effective_rate),
            ("taxes taxablePortfolioRatio", taxes.taxable_portfolio_ratio),
            ("taxes taxableIncomeRatio", taxes.taxable_income_ratio),
        ] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(SimulationError::validation(format!(
                    "{name} must be in [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndBalancePercentiles {
    pub p20: f64,
    pub p50: f64,
    pub p80: f64,
}

/// Summary of one simulation run. All monetary values are nominal; the
/// percentile paths have one entry per age from `currentAge` through
/// `endAge` inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub ages: Vec<u32>,
    pub p20: Vec<f64>,
    pub p50: Vec<f64>,
    pub p80: Vec<f64>,
    pub end_balance_percentiles: EndBalancePercentiles,
    pub success_prob: f64,
}
