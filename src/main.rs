use clap::Parser;
use color_eyre::eyre;
use cpucachesim::config::HierarchyConfig;
use cpucachesim::hierarchy::Hierarchy;
use cpucachesim::mem::QueueResult;
use cpucachesim::packet::{AccessType, FillLevel, Packet};
use cpucachesim::LOG2_BLOCK_SIZE;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Simulated cycles to run
    #[arg(value_name = "CYCLES", default_value_t = 1_000_000)]
    cycles: u64,

    /// Cycles before statistics start counting toward the ROI
    #[arg(long = "warmup", default_value_t = 100_000)]
    warmup_cycles: u64,

    /// Number of simulated cpus sharing the LLC
    #[arg(long = "cpus", default_value_t = 2)]
    num_cpus: usize,

    /// Flat DRAM latency in cycles
    #[arg(long = "dram-latency", default_value_t = 200)]
    dram_latency: u64,

    /// Blocks in each cpu's synthetic working set
    #[arg(long = "footprint", default_value_t = 1 << 14)]
    footprint_blocks: u64,

    /// Issue one demand access per cpu every N cycles
    #[arg(long = "issue-interval", default_value_t = 4)]
    issue_interval: u64,

    /// Let the LLC decline prefetch fills
    #[arg(long = "llc-bypass-prefetch")]
    llc_bypass_prefetch: bool,

    /// Stats output file (JSON)
    #[arg(short = 'o', long = "stats", value_name = "STATS_OUT")]
    stats_out_file: Option<PathBuf>,
}

/// Deterministic per-cpu access stream over a bounded footprint; a crude
/// stand-in for the core front-end, which is outside this simulator's scope.
struct SyntheticStream {
    state: u64,
    footprint_blocks: u64,
    instr_id: u64,
}

impl SyntheticStream {
    fn new(cpu: usize, footprint_blocks: u64) -> Self {
        Self {
            state: 0x9e37_79b9_7f4a_7c15 ^ ((cpu as u64) << 32),
            footprint_blocks,
            instr_id: 0,
        }
    }

    fn next_packet(&mut self, cpu: usize) -> Packet {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.instr_id += 1;
        // skewed footprint: half the references fall into a hot eighth
        let raw = self.state >> 11;
        let span = if raw & 1 == 0 {
            self.footprint_blocks / 8
        } else {
            self.footprint_blocks
        }
        .max(1);
        let block = (raw >> 1) % span + (cpu as u64 + 1) * 0x10_0000;
        let is_store = raw & 0xf == 3;
        Packet {
            address: block,
            full_addr: block << LOG2_BLOCK_SIZE,
            cpu,
            instr_id: self.instr_id,
            ip: 0x40_0000 + (self.instr_id % 512) * 4,
            ty: if is_store {
                AccessType::Rfo
            } else {
                AccessType::Load
            },
            fill_level: FillLevel::L1,
            fill_l1d: true,
            is_data: true,
            lq_index: (self.instr_id % cpucachesim::LQ_SIZE as u64) as usize,
            sq_index: (self.instr_id % cpucachesim::SQ_SIZE as u64) as usize,
            ..Packet::default()
        }
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    cpucachesim::init_logging();

    let start = Instant::now();
    let options = Options::parse();

    let config = HierarchyConfig {
        num_cpus: options.num_cpus,
        dram_latency: options.dram_latency,
        llc_bypass_prefetch_fill: options.llc_bypass_prefetch,
    };
    let hierarchy = Hierarchy::new(&config)?;

    let mut streams: Vec<SyntheticStream> = (0..options.num_cpus)
        .map(|cpu| SyntheticStream::new(cpu, options.footprint_blocks))
        .collect();
    let mut pending: Vec<Option<Packet>> = (0..options.num_cpus).map(|_| None).collect();
    let mut retired = vec![0u64; options.num_cpus];

    for cycle in 1..=options.cycles {
        if cycle == options.warmup_cycles {
            hierarchy.clock().complete_warmup();
        }
        if cycle % options.issue_interval == 0 {
            for (cpu, stream) in streams.iter_mut().enumerate() {
                let mut packet = pending[cpu]
                    .take()
                    .unwrap_or_else(|| stream.next_packet(cpu));
                packet.event_cycle = 0;

                // the front-end translates the page before touching the data;
                // TLBs are indexed by page number
                let mut translation = Packet {
                    ty: AccessType::Load,
                    tlb_access: true,
                    address: packet.full_addr >> cpucachesim::LOG2_PAGE_SIZE,
                    event_cycle: 0,
                    ..packet.clone()
                };
                hierarchy.dtlb[cpu].lock().add_rq(&mut translation);

                if hierarchy.l1d[cpu].lock().add_rq(&mut packet) == QueueResult::Full {
                    // keep it for the next slot instead of dropping the access
                    pending[cpu] = Some(packet);
                }
            }
        }
        hierarchy.tick();
        for cpu in 0..options.num_cpus {
            for cache in [&hierarchy.l1d[cpu], &hierarchy.dtlb[cpu]] {
                let mut cache = cache.lock();
                while cache.processed.occupancy() > 0 {
                    cache.processed.pop_head();
                    retired[cpu] += 1;
                }
            }
        }
    }

    let report = hierarchy.report();
    eprintln!("\n==== {} cpus, {} cycles ====", options.num_cpus, options.cycles);
    eprintln!("retired demand replies per cpu: {retired:?}");
    eprint!("{report}");
    eprintln!("simulated {} cycles in {:?}", options.cycles, start.elapsed());

    if let Some(path) = options.stats_out_file.as_ref() {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &report)?;
        eprintln!("wrote stats to {}", path.display());
    }
    Ok(())
}
