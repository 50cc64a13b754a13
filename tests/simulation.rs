//! End-to-end checks: simulate, index, mutate, generate haplotypes and
//! newick text, then round-trip through both storage formats.

use std::path::PathBuf;

use coalescent_rs::archive::DumpFlags;
use coalescent_rs::tree_file::{Mode, TreeFile};
use coalescent_rs::{
    HaplotypeGenerator, NewickConverter, Order, RunStatus, Simulator, SimulatorConfig, TreeFlags,
    TreeSequence,
};

fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("coalescent_rs_e2e_{}_{}", std::process::id(), name))
}

fn completed(config: SimulatorConfig) -> Simulator {
    let mut sim = Simulator::new(config).unwrap();
    assert_eq!(sim.run(f64::INFINITY, u64::MAX).unwrap(), RunStatus::Complete);
    sim
}

#[test]
fn full_pipeline_with_recombination_and_mutations() {
    let n = 4u32;
    let m = 100u32;
    let sim = completed(SimulatorConfig {
        sample_size: n,
        num_loci: m,
        recombination_rate: 0.4,
        random_seed: 20_240_601,
        ..SimulatorConfig::default()
    });
    let mut ts = TreeSequence::from_simulator(&sim).unwrap();
    ts.generate_mutations(1.2, 20_240_601).unwrap();

    // The marginal trees partition the genome and stay binary.
    let mut iter = ts.trees(TreeFlags::COUNT_LEAVES).unwrap();
    let mut last_right = 1u32;
    while iter.advance() {
        let tree = iter.tree();
        let (left, right) = tree.interval();
        assert_eq!(left, last_right);
        assert!(right > left);
        last_right = right;
        assert_eq!(tree.num_leaves(tree.root()).unwrap(), n);
        for sample in 1..=n {
            assert_eq!(tree.mrca(sample, sample).unwrap(), sample);
        }
    }
    assert_eq!(last_right, m + 1);

    // Haplotypes exist for every sample and have one column per site.
    let generator = HaplotypeGenerator::new(&ts).unwrap();
    assert_eq!(generator.num_segregating_sites(), ts.num_mutations());
    for sample in 1..=n {
        assert_eq!(generator.haplotype(sample).unwrap().len(), ts.num_mutations());
    }

    // Newick output covers the same genome partition.
    let spans: u32 = NewickConverter::new(&ts, 5)
        .unwrap()
        .map(|tree| tree.unwrap().0)
        .sum();
    assert_eq!(spans, m);

    // Archive round trip preserves the whole sequence, mutations and
    // provenance included.
    let path = scratch_path("pipeline.trees");
    ts.dump(&path, DumpFlags::ZLIB_COMPRESSION).unwrap();
    let reloaded = TreeSequence::load(&path).unwrap();
    assert_eq!(ts, reloaded);
    std::fs::remove_file(&path).ok();
}

#[test]
fn zero_mutation_rate_gives_blank_haplotypes() {
    let sim = completed(SimulatorConfig {
        sample_size: 5,
        num_loci: 20,
        recombination_rate: 0.1,
        random_seed: 77,
        ..SimulatorConfig::default()
    });
    let mut ts = TreeSequence::from_simulator(&sim).unwrap();
    ts.generate_mutations(0.0, 77).unwrap();
    let generator = HaplotypeGenerator::new(&ts).unwrap();
    assert_eq!(generator.num_segregating_sites(), 0);
    for sample in 1..=5 {
        assert!(generator.haplotype(sample).unwrap().is_empty());
    }
}

#[test]
fn legacy_file_round_trip_agrees_with_archive() {
    let sim = completed(SimulatorConfig {
        sample_size: 6,
        num_loci: 40,
        recombination_rate: 0.3,
        random_seed: 99,
        ..SimulatorConfig::default()
    });
    let ts = TreeSequence::from_simulator(&sim).unwrap();

    let legacy = scratch_path("legacy.dat");
    TreeFile::dump_simulation(&legacy, &sim).unwrap();
    TreeFile::open(&legacy, Mode::Update).unwrap().sort().unwrap();
    let recovered = TreeFile::open(&legacy, Mode::Read)
        .unwrap()
        .to_tree_sequence()
        .unwrap();

    assert_eq!(recovered.num_records(), ts.num_records());
    assert_eq!(recovered.num_nodes(), ts.num_nodes());
    for j in 0..ts.num_records() {
        let a = ts.record(j, Order::Left).unwrap();
        let b = recovered.record(j, Order::Left).unwrap();
        assert_eq!((a.left, a.right, a.node, a.children), (b.left, b.right, b.node, b.children));
    }
    std::fs::remove_file(&legacy).ok();
}

#[test]
fn replicates_differ_but_reruns_do_not() {
    let run = |seed: u64| {
        let sim = completed(SimulatorConfig {
            sample_size: 6,
            num_loci: 50,
            recombination_rate: 0.5,
            random_seed: seed,
            ..SimulatorConfig::default()
        });
        sim.coalescence_records().unwrap()
    };
    assert_eq!(run(1), run(1));
    assert_ne!(run(1), run(2));
}
