use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::ProgressBar;
use rand::Rng;

use coalescent_rs::archive::DumpFlags;
use coalescent_rs::{
    HaplotypeGenerator, NewickConverter, PopulationModel, RunStatus, Simulator, SimulatorConfig,
    TreeSequence,
};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(about = "Simulate the coalescent with recombination and dump a tree-sequence archive")]
struct Args {
    #[arg(long, default_value_t = 10)]
    sample_size: u32,
    #[arg(long, default_value_t = 100)]
    num_loci: u32,
    /// Random seed (random if omitted)
    #[arg(long)]
    seed: Option<u64>,
    /// Scaled recombination rate per link
    #[arg(long, default_value_t = 0.0)]
    recombination_rate: f64,
    /// Scaled mutation rate (0 = no mutations)
    #[arg(long, default_value_t = 0.0)]
    mutation_rate: f64,
    /// Set the population size to X at time T (repeatable)
    #[arg(long, num_args = 2, value_names = ["T", "X"])]
    size_event: Vec<f64>,
    /// Exponential growth at rate ALPHA from time T (repeatable)
    #[arg(long, num_args = 2, value_names = ["T", "ALPHA"])]
    growth_event: Vec<f64>,
    /// Exponential growth at rate ALPHA from time zero
    #[arg(long)]
    growth_rate: Option<f64>,
    /// Memory cap; supports K, M and G suffixes
    #[arg(long, default_value = "100M")]
    max_memory: String,
    #[arg(long, default_value_t = 1024)]
    segment_block_size: usize,
    #[arg(long, default_value_t = 1024)]
    avl_node_block_size: usize,
    #[arg(long, default_value_t = 1024)]
    node_mapping_block_size: usize,
    #[arg(long, default_value_t = 1024)]
    coalescence_record_block_size: usize,
    #[arg(long, default_value = "out.trees")]
    output: String,
    /// Shuffle + deflate the archive datasets
    #[arg(long)]
    compress: bool,
    /// Print the coalescence records of the reloaded sequence
    #[arg(long)]
    print_records: bool,
    /// Dump the simulator state after the run
    #[arg(long)]
    print_state: bool,
    /// Print the haplotype strings
    #[arg(long)]
    print_haplotypes: bool,
    /// Print newick trees with this precision
    #[arg(long)]
    newick: Option<usize>,
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

fn population_models(args: &Args) -> Vec<PopulationModel> {
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
    models
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    if args.mutation_rate < 0.0 {
        bail!("mutation rate must be non-negative");
    }
    let random_seed = args
        .seed
        .unwrap_or_else(|| rand::rng().random_range(1..u64::MAX));
    let config = SimulatorConfig {
        sample_size: args.sample_size,
        num_loci: args.num_loci,
        recombination_rate: args.recombination_rate,
        random_seed,
        population_models: population_models(&args),
        max_memory: parse_memory(&args.max_memory)?,
        segment_block_size: args.segment_block_size,
        avl_node_block_size: args.avl_node_block_size,
        node_mapping_block_size: args.node_mapping_block_size,
        coalescence_record_block_size: args.coalescence_record_block_size,
    };
    eprintln!(
        "=== Coalescent: n = {}, m = {}, rho = {}, seed = {} ===",
        config.sample_size, config.num_loci, config.recombination_rate, random_seed
    );

    let mut sim = Simulator::new(config)?;
    let bar = ProgressBar::new_spinner();
    loop {
        match sim.run(f64::INFINITY, 10_000)? {
            RunStatus::Complete => break,
            _ => {
                bar.set_message(format!(
                    "t = {:.4}, {} lineages, {} records",
                    sim.time(),
                    sim.num_ancestors(),
                    sim.num_coalescence_records()
                ));
                bar.tick();
            }
        }
    }
    bar.finish_and_clear();
    eprintln!(
        "coalesced at t = {:.6} after {} coalescence / {} recombination events",
        sim.time(),
        sim.num_coalescence_events(),
        sim.num_recombination_events()
    );
    eprintln!("peak memory: {} bytes", sim.peak_memory());
    if args.print_state {
        sim.print_state(&mut std::io::stderr().lock())?;
    }

    let mut ts = TreeSequence::from_simulator(&sim)?;
    if args.mutation_rate > 0.0 {
        ts.generate_mutations(args.mutation_rate, random_seed)?;
        eprintln!("{} segregating sites", ts.num_mutations());
    }

    let flags = if args.compress { DumpFlags::ZLIB_COMPRESSION } else { DumpFlags::empty() };
    let path = std::path::Path::new(&args.output);
    ts.dump(path, flags)?;
    eprintln!("wrote {} records to {}", ts.num_records(), args.output);

    // Read our own output back so every reported value reflects the file.
    let ts = TreeSequence::load(path)?;
    if args.print_records {
        for record in ts.records() {
            println!(
                "{}\t{}\t{}\t{}\t{}\t{:.6}",
                record.left,
                record.right,
                record.children[0],
                record.children[1],
                record.node,
                record.time
            );
        }
    }
    if let Some(precision) = args.newick {
        for tree in NewickConverter::new(&ts, precision)? {
            let (span, newick) = tree?;
            println!("[{span}]{newick}");
        }
    }
    if args.print_haplotypes {
        let generator = HaplotypeGenerator::new(&ts)?;
        for sample in 1..=ts.sample_size() {
            println!("{}\t{}", sample, generator.haplotype(sample)?);
        }
    }
    Ok(())
}
