use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use coalescent_rs::{
    HaplotypeGenerator, NewickConverter, PopulationModel, RunStatus, Simulator, SimulatorConfig,
    TreeSequence,
};

// ── CLI ───────────────────────────────────────────────────────────────────────

/// An ms-compatible interface to the coalescent simulator. Supports a
/// subset of the functionality available in ms.
#[derive(Parser)]
#[command(about = "ms-compatible coalescent simulation front end")]
struct Args {
    /// Sample size
    sample_size: u32,
    /// Number of independent replicates
    num_replicates: u32,
    /// Mutation rate theta = 4*N0*mu
    #[arg(short = 't', long, value_name = "theta")]
    mutation_rate: Option<f64>,
    /// Print out trees in Newick format
    #[arg(short = 'T', long)]
    trees: bool,
    /// Recombination at rate rho = 4*N0*r across the region, over
    /// num_loci sites between which recombination can occur
    #[arg(short = 'r', long, num_args = 2, value_names = ["rho", "num_loci"])]
    recombination: Option<Vec<f64>>,
    /// Population growth rate alpha
    #[arg(short = 'G', long, value_name = "alpha")]
    growth_rate: Option<f64>,
    /// Set the growth rate to alpha at time t (repeatable)
    #[arg(long, num_args = 2, value_names = ["t", "alpha"])]
    growth_event: Vec<f64>,
    /// Set the population size to x * N0 at time t (repeatable)
    #[arg(long, num_args = 2, value_names = ["t", "x"])]
    size_event: Vec<f64>,
    /// Random seeds (three integers, truncated to 16 bits as in ms)
    #[arg(long, num_args = 3, value_names = ["x1", "x2", "x3"])]
    random_seeds: Option<Vec<u64>>,
    /// Number of decimals printed for branch lengths
    #[arg(short = 'p', long, default_value_t = 3)]
    precision: usize,
    /// Maximum memory; supports K, M and G suffixes
    #[arg(short = 'M', long, default_value = "100M")]
    max_memory: String,
}

fn parse_memory(text: &str) -> Result<usize> {
    let text = text.trim();
    let (digits, multiplier) = match text.chars().last() {
        Some('K') | Some('k') => (&text[..text.len() - 1], 1024),
        Some('M') | Some('m') => (&text[..text.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    let value: usize = digits.parse().with_context(|| format!("bad memory size '{text}'"))?;
    Ok(value * multiplier)
}

/// ms truncates its three seeds to shorts; the master seed packs them
/// into one 64-bit value.
fn resolve_seeds(given: Option<&[u64]>) -> (u64, [u64; 3]) {
    let max_seed = (1 << 16) - 1;
    let seeds: [u64; 3] = match given {
        Some(s) => [s[0].min(max_seed), s[1].min(max_seed), s[2].min(max_seed)],
        None => {
            let mut rng = rand::rng();
            std::array::from_fn(|_| rng.random_range(1..=max_seed))
        }
    };
    let master = (seeds[0] << 32) | (seeds[1] << 16) | seeds[2];
    (master, seeds)
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    let (rho, num_loci) = match args.recombination.as_deref() {
        Some([rho, loci]) => (*rho, *loci as u32),
        _ => (0.0, 1),
    };
    // The per-link rate: rho spans the whole region.
    let per_link_rate = if num_loci > 1 { rho / (num_loci - 1) as f64 } else { 0.0 };

    let mut models = Vec::new();
    if let Some(alpha) = args.growth_rate {
        models.push(PopulationModel::Exponential { start_time: 0.0, alpha });
    }
    for pair in args.growth_event.chunks(2) {
        models.push(PopulationModel::Exponential { start_time: pair[0], alpha: pair[1] });
    }
    for pair in args.size_event.chunks(2) {
        models.push(PopulationModel::Constant { start_time: pair[0], size: pair[1] });
    }
    models.sort_by(|a, b| a.start_time().total_cmp(&b.start_time()));

    let (master_seed, ms_seeds) = resolve_seeds(args.random_seeds.as_deref());
    let mut seed_rng = SmallRng::seed_from_u64(master_seed);
    let max_memory = parse_memory(&args.max_memory)?;

    // ms output: the command line, then the seeds, then one block per
    // replicate.
    let command_line: Vec<String> = std::env::args().collect();
    println!("{}", command_line.join(" "));
    println!("{} {} {}", ms_seeds[0], ms_seeds[1], ms_seeds[2]);

    for _ in 0..args.num_replicates {
        let config = SimulatorConfig {
            sample_size: args.sample_size,
            num_loci,
            recombination_rate: per_link_rate,
            random_seed: seed_rng.random_range(0..1u64 << 30),
            population_models: models.clone(),
            max_memory,
            ..SimulatorConfig::default()
        };
        let mutation_seed = config.random_seed;
        let mut sim = Simulator::new(config)?;
        let status = sim.run(f64::INFINITY, u64::MAX)?;
        debug_assert_eq!(status, RunStatus::Complete);
        let mut ts = TreeSequence::from_simulator(&sim)?;

        println!();
        println!("//");
        if args.trees {
            for tree in NewickConverter::new(&ts, args.precision)? {
                let (span, newick) = tree?;
                if num_loci == 1 {
                    println!("{newick}");
                } else {
                    println!("[{span}]{newick}");
                }
            }
        }
        if let Some(theta) = args.mutation_rate {
            ts.generate_mutations(theta, mutation_seed)?;
            let generator = HaplotypeGenerator::new(&ts)?;
            let sites = generator.num_segregating_sites();
            println!("segsites: {sites}");
            if sites > 0 {
                let positions: Vec<String> = ts
                    .mutations()
                    .map(|m| format!("{:.4}", m.position / (ts.num_loci() as f64 + 1.0)))
                    .collect();
                println!("positions: {}", positions.join(" "));
                for sample in 1..=ts.sample_size() {
                    println!("{}", generator.haplotype(sample)?);
                }
            } else {
                println!();
            }
        }
    }
    Ok(())
}
