use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use super::error::SimulationError;
use super::params::{FatTailParams, ParamPack};
use super::returns::ReturnModel;
use super::types::{
    EndBalancePercentiles, Scenario, SimulationResult, ASSET_COUNT,
};

/// Well-known default seed so that runs are reproducible out of the box.
pub const DEFAULT_SEED: u64 = 42;

/// Simulations per worker chunk. Each chunk owns an independent substream
/// and a private slice of the path matrix.
const CHUNK_SIZE: usize = 2_000;

const MAIN_STREAM: u64 = 0;
const PILOT_STREAM: u64 = 1;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub seed: Option<u64>,
    pub timeout: Option<Duration>,
    pub cancel: Option<Arc<AtomicBool>>,
    /// Jump calibration override; the built-in defaults apply when absent.
    pub params: Option<ParamPack>,
}

/// Run a scenario with the default seed and no deadline.
pub fn simulate(scenario: &Scenario) -> Result<SimulationResult, SimulationError> {
    simulate_with(scenario, &RunOptions::default())
}

/// Run a scenario. Deterministic given (scenario, seed): chunk substreams
/// are derived from the master seed, so thread scheduling cannot change
/// the result.
pub fn simulate_with(
    scenario: &Scenario,
    options: &RunOptions,
) -> Result<SimulationResult, SimulationError> {
    let started = Instant::now();
    scenario.validate()?;

    let seed = options.seed.unwrap_or(DEFAULT_SEED);
    let initial_balance = scenario.initial_balance();
    let weights = scenario.target_weights()?;
    let n_years = scenario.n_years();
    let n_sims = scenario.n_sims as usize;
    let ages: Vec<u32> = (scenario.current_age..=scenario.end_age).collect();

    if n_years == 0 {
        return Ok(SimulationResult {
            ages,
            p20: vec![initial_balance],
            p50: vec![initial_balance],
            p80: vec![initial_balance],
            end_balance_percentiles: EndBalancePercentiles {
                p20: initial_balance,
                p50: initial_balance,
                p80: initial_balance,
            },
            success_prob: 1.0,
        });
    }

    let flag = options
        .cancel
        .clone()
        .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
    let cancel = CancelState {
        flag: &flag,
        deadline: options.timeout.map(|t| started + t),
    };

    let cma = &scenario.cma;
    let mut tails = FatTailParams::from_cma(cma, scenario.black_swan.enabled);
    if let Some(pack) = &options.params {
        tails = tails.with_pack(pack);
    }
    let mut model = ReturnModel::with_tails(cma.exp_ret, cma.vol, cma.corr, tails)?;
    run_pilot(&mut model, seed, &cancel)?;

    let flows = year_flows(scenario);
    let chunks = chunk_ranges(n_sims, CHUNK_SIZE);
    let model_ref = &model;
    let slabs: Vec<Vec<f64>> = chunks
        .par_iter()
        .enumerate()
        .map(|(chunk_id, &(start, len))| -> Result<Vec<f64>, SimulationError> {
            cancel.check()?;
            let mut rng =
                ChaCha8Rng::seed_from_u64(derive_seed(seed, MAIN_STREAM, chunk_id as u64));
            let returns = model_ref.draw_chunk(n_years, len, &mut rng)?;
            simulate_paths(
                &flows,
                &weights,
                &returns,
                n_years,
                len,
                initial_balance,
                start,
                &cancel,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Stitch chunk slabs back into year rows and summarize.
    let mut p20 = Vec::with_capacity(n_years + 1);
    let mut p50 = Vec::with_capacity(n_years + 1);
    let mut p80 = Vec::with_capacity(n_years + 1);
    let mut row = vec![0.0; n_sims];
    let mut survivors = 0usize;
    for y in 0..=n_years {
        for (slab, &(start, len)) in slabs.iter().zip(&chunks) {
            row[start..start + len].copy_from_slice(&slab[y * len..(y + 1) * len]);
        }
        if y == n_years {
            survivors = row.iter().filter(|b| **b > 0.0).count();
        }
        p20.push(percentile(&mut row, 20.0));
        p50.push(percentile(&mut row, 50.0));
        p80.push(percentile(&mut row, 80.0));
    }

    let success_prob = survivors as f64 / n_sims as f64;
    let end_balance_percentiles = EndBalancePercentiles {
        p20: p20[n_years],
        p50: p50[n_years],
        p80: p80[n_years],
    };

    tracing::info!(
        n_sims,
        n_years,
        success_prob,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "simulation run complete"
    );

    Ok(SimulationResult {
        ages,
        p20,
        p50,
        p80,
        end_balance_percentiles,
        success_prob,
    })
}

/// Cooperative cancellation: workers poll between years; a missed deadline
/// raises the shared flag so sibling chunks stop too.
#[derive(Copy, Clone)]
struct CancelState<'a> {
    flag: &'a AtomicBool,
    deadline: Option<Instant>,
}

impl CancelState<'_> {
    fn check(&self) -> Result<(), SimulationError> {
        if self.flag.load(Ordering::Relaxed) {
            return Err(SimulationError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.flag.store(true, Ordering::Relaxed);
                return Err(SimulationError::Cancelled);
            }
        }
        Ok(())
    }
}

/// Estimate per-asset means on an independent substream and fold the drift
/// correction into the model before the production pass.
fn run_pilot(
    model: &mut ReturnModel,
    seed: u64,
    cancel: &CancelState<'_>,
) -> Result<(), SimulationError> {
    if !model.needs_mean_correction() {
        return Ok(());
    }

    let years = model.pilot_years;
    let sims = model.pilot_sims;
    let chunks = chunk_ranges(sims, CHUNK_SIZE);
    let model_ref = &*model;
    let partials: Vec<[f64; ASSET_COUNT]> = chunks
        .par_iter()
        .enumerate()
        .map(
            |(chunk_id, &(_, len))| -> Result<[f64; ASSET_COUNT], SimulationError> {
                cancel.check()?;
                let mut rng =
                    ChaCha8Rng::seed_from_u64(derive_seed(seed, PILOT_STREAM, chunk_id as u64));
                let returns = model_ref.draw_chunk(years, len, &mut rng)?;
                let mut sums = [0.0; ASSET_COUNT];
                for cell in returns.chunks_exact(ASSET_COUNT) {
                    for (a, v) in cell.iter().enumerate() {
                        sums[a] += v;
                    }
                }
                Ok(sums)
            },
        )
        .collect::<Result<Vec<_>, _>>()?;

    let mut totals = [0.0; ASSET_COUNT];
    for partial in &partials {
        for (t, v) in totals.iter_mut().zip(partial) {
            *t += v;
        }
    }
    let cells = (years * sims) as f64;
    let delta = model.apply_mean_correction(&totals, cells)?;
    tracing::debug!(?delta, "pilot drift correction applied");
    Ok(())
}

/// Deterministic cashflows for one simulated year, shared by every path.
#[derive(Debug, Clone, Copy)]
struct YearFlow {
    /// Cash leaving the portfolio after income, lumps and gross-up for
    /// withdrawal taxes. Negative when income and lumps exceed spending.
    net_withdrawal: f64,
    /// Balance multiplier for a scheduled black-swan event, 1.0 otherwise.
    shock: f64,
}

fn year_flows(scenario: &Scenario) -> Vec<YearFlow> {
    let taxes = &scenario.taxes;
    (0..scenario.n_years())
        .map(|y| {
            let age = scenario.current_age + y as u32;
            let income = income_at(scenario, age);
            let spending = spending_at(scenario, age);
            let lump: f64 = scenario
                .lumps
                .iter()
                .filter(|l| l.age == age)
                .map(|l| l.amount)
                .sum();

            // Income is taxed on its taxable share first; what spending it
            // cannot cover is withdrawn grossed up for withdrawal taxes.
            let net_income =
                income * (1.0 - taxes.effective_rate * taxes.taxable_income_ratio);
            let need = spending - net_income - lump;
            let net_withdrawal = if need > 0.0 {
                need * (1.0 + taxes.effective_rate * taxes.taxable_portfolio_ratio)
            } else {
                need
            };

            let shock = if scenario.black_swan.enabled && age == scenario.black_swan.age {
                1.0 - scenario.black_swan.portfolio_drop
            } else {
                1.0
            };

            YearFlow {
                net_withdrawal,
                shock,
            }
        })
        .collect()
}

fn income_at(scenario: &Scenario, age: u32) -> f64 {
    let mut income = 0.0;

    let consulting = &scenario.consulting;
    if consulting.years > 0
        && age >= consulting.start_age
        && age < consulting.start_age + consulting.years
    {
        let k = (age - consulting.start_age) as i32;
        income += consulting.start_amount * (1.0 + consulting.growth).powi(k);
    }

    for stream in &scenario.incomes {
        if stream.start_age <= age && age <= stream.end_age {
            let k = (age - stream.start_age) as i32;
            income += stream.monthly * 12.0 * (1.0 + stream.cola).powi(k);
        }
    }

    income
}

fn spending_at(scenario: &Scenario, age: u32) -> f64 {
    let spending = &scenario.spending;
    let base = if age < spending.reduce_at_age {
        spending.base_annual
    } else {
        spending.reduced_annual
    };
    let k = (age - scenario.current_age) as i32;
    let mut amount = base * (1.0 + spending.inflation).powi(k);
    for toy in &scenario.toys {
        if toy.age == age {
            amount += toy.amount;
        }
    }
    amount
}

/// Walk one chunk of paths through every year. Returns a row-major
/// (years + 1, len) balance slab; row 0 is the initial balance. A depleted
/// path stays at zero for the rest of its trajectory.
#[allow(clippy::too_many_arguments)]
fn simulate_paths(
    flows: &[YearFlow],
    weights: &[f64; ASSET_COUNT],
    returns: &[f64],
    n_years: usize,
    len: usize,
    initial_balance: f64,
    path_offset: usize,
    cancel: &CancelState<'_>,
) -> Result<Vec<f64>, SimulationError> {
    let mut balances = vec![0.0; (n_years + 1) * len];
    balances[..len].fill(initial_balance);
    let mut alive = vec![true; len];

    for (y, flow) in flows.iter().enumerate() {
        cancel.check()?;
        for s in 0..len {
            if !alive[s] {
                continue;
            }
            let shocked = balances[y * len + s] * flow.shock;

            let base = (y * len + s) * ASSET_COUNT;
            let mut portfolio_return = 0.0;
            for (w, r) in weights.iter().zip(&returns[base..base + ASSET_COUNT]) {
                portfolio_return += w * r;
            }

            let balance = (shocked - flow.net_withdrawal) * (1.0 + portfolio_return);
            if !balance.is_finite() {
                return Err(SimulationError::Internal {
                    path: path_offset + s,
                    year: y,
                    message: "balance is not finite".to_string(),
                });
            }
            if balance <= 0.0 {
                alive[s] = false;
            } else {
                balances[(y + 1) * len + s] = balance;
            }
        }
    }

    Ok(balances)
}

fn chunk_ranges(total: usize, size: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::with_capacity(total.div_ceil(size));
    let mut start = 0;
    while start < total {
        let len = size.min(total - start);
        ranges.push((start, len));
        start += len;
    }
    ranges
}

fn derive_seed(base_seed: u64, stream: u64, chunk: u64) -> u64 {
    mix_seed(base_seed ^ (stream << 48) ^ chunk)
}

/// SplitMix64 finalizer (Steele, Lea & Flood's published constants). One
/// round is enough to decorrelate the structured stream/chunk keys.
fn mix_seed(key: u64) -> u64 {
    let mut z = key.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Empirical quantile, linearly interpolated between order statistics
/// (the "type 7" convention).
fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(f64::total_cmp);

    let position = (p / 100.0).clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let index = position as usize;
    let fraction = position - index as f64;
    if fraction == 0.0 || index + 1 == values.len() {
        values[index]
    } else {
        values[index] + fraction * (values[index + 1] - values[index])
    }
}
