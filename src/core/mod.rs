mod engine;
mod error;
mod params;
mod returns;
mod types;

pub use engine::{simulate, simulate_with, RunOptions, DEFAULT_SEED};
pub use error::SimulationError;
pub use params::{
    AdjustedJumps, FatTailParams, KouParams, MarketJumpParams, ParamPack, TailFrequency,
    TailMagnitude, TailSkew, PARAM_PACK_VERSION,
};
pub use returns::ReturnModel;
pub use types::{
    Account, Asset, BlackSwan, CapitalMarketAssumptions, ConsultingLadder, EndBalancePercentiles,
    IncomeStream, LumpEvent, Scenario, SimulationResult, Spending, Taxes, ToyPurchase,
    ASSET_COUNT, MAX_SIMULATIONS,
};
