//! GPU compute CLI - Run example workloads from a JSON session configuration.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use gpu_compute_core::{
    backend::{Backend, SoftwareBackend, WgpuBackend},
    core::ComputeContext,
    schema::{BackendKind, Capability, SessionConfig},
    workloads::{CountedMatrixMultiply, Matrix, MatrixMultiply, Precision, ScaleKernel, WorkloadError},
};

/// Workloads selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workload {
    Matmul,
    MatmulF16,
    MatmulTimed,
    Counted,
    Scale,
    ScaleSplit,
}

impl Workload {
    const ALL: [Workload; 6] = [
        Workload::Matmul,
        Workload::MatmulF16,
        Workload::MatmulTimed,
        Workload::Counted,
        Workload::Scale,
        Workload::ScaleSplit,
    ];

    fn name(self) -> &'static str {
        match self {
            Workload::Matmul => "matmul",
            Workload::MatmulF16 => "matmul-f16",
            Workload::MatmulTimed => "matmul-timed",
            Workload::Counted => "counted",
            Workload::Scale => "scale",
            Workload::ScaleSplit => "scale-split",
        }
    }

    /// Capability the device must grant for the workload to run.
    fn requires(self) -> Option<Capability> {
        match self {
            Workload::MatmulF16 => Some(Capability::ShaderF16),
            Workload::MatmulTimed => Some(Capability::TimestampQuery),
            _ => None,
        }
    }
}

impl FromStr for Workload {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Workload::ALL
            .into_iter()
            .find(|w| w.name() == s)
            .ok_or_else(|| format!("unknown workload: {}", s))
    }
}

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json> [workload...]", args[0]);
        eprintln!();
        eprintln!("Run example compute workloads on the configured device.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to session configuration file");
        eprintln!(
            "  workload     One of: {} (default: all the device supports)",
            Workload::ALL.map(Workload::name).join(", ")
        );
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);
    let config = SessionConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    });

    let selected: Vec<Workload> = args[2..]
        .iter()
        .map(|name| name.parse())
        .collect::<Result<_, _>>()
        .unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        });

    println!("GPU Compute");
    println!("===========");
    println!("Config: {}", config_path.display());
    println!("Backend: {:?}", config.backend);
    println!();

    let outcome = match config.backend {
        BackendKind::Software => pollster::block_on(run(
            SoftwareBackend::with_profile(config.software.clone()),
            &config,
            &selected,
        )),
        BackendKind::Wgpu => pollster::block_on(run(WgpuBackend::new(), &config, &selected)),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run<B: Backend>(
    backend: B,
    config: &SessionConfig,
    selected: &[Workload],
) -> Result<(), WorkloadError> {
    let mut ctx = ComputeContext::acquire(backend, config.device_request()).await?;
    let info = ctx.info().clone();
    println!("Adapter: {} ({})", info.adapter, B::NAME);
    println!(
        "Capabilities: [{}]",
        info.capabilities
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Timestamp period: {} ns", info.timestamp_period);
    println!();

    let workloads: Vec<Workload> = if selected.is_empty() {
        Workload::ALL
            .into_iter()
            .filter(|w| w.requires().is_none_or(|c| info.capabilities.contains(&c)))
            .collect()
    } else {
        selected.to_vec()
    };

    let first = Matrix::new(2, 4, (1..=8).map(|v| v as f32).collect())?;
    let second = Matrix::new(4, 2, (1..=8).map(|v| v as f32).collect())?;
    let input: Vec<f32> = (1..=10).map(|v| v as f32).collect();

    for workload in workloads {
        let start = Instant::now();
        println!("[{}]", workload.name());
        match workload {
            Workload::Matmul | Workload::MatmulF16 => {
                let precision = if workload == Workload::Matmul {
                    Precision::F32
                } else {
                    Precision::F16
                };
                let matmul = MatrixMultiply::new(&mut ctx, precision).await?;
                let product = matmul.run(&mut ctx, &first, &second).await?;
                println!("  Product: {:?}", product.values());
            }
            Workload::MatmulTimed => {
                let matmul = MatrixMultiply::new(&mut ctx, Precision::F32).await?;
                let (product, timings) = matmul.run_timed(&mut ctx, &first, &second).await?;
                println!("  Product: {:?}", product.values());
                println!("  Compute: {:?}", timings.compute);
                if let (Some(transfer), Some(total)) = (timings.transfer, timings.total) {
                    println!("  Transfer: {:?}", transfer);
                    println!("  Total: {:?}", total);
                }
            }
            Workload::Counted => {
                let counted = CountedMatrixMultiply::new(&mut ctx).await?;
                let outcome = counted.run(&mut ctx, &first, &second).await?;
                println!("  Product: {:?}", outcome.product.values());
                println!("  Cells computed: {}", outcome.computed);
            }
            Workload::Scale | Workload::ScaleSplit => {
                let scale = ScaleKernel::new(&mut ctx, 2.0, input.len()).await?;
                let output = if workload == Workload::Scale {
                    scale.compute(&mut ctx, &input).await?
                } else {
                    scale.compute_split(&mut ctx, &input).await?
                };
                println!("  Output: {:?}", output);
                scale.release(&mut ctx)?;
            }
        }
        println!("  Time: {:.3} ms", start.elapsed().as_secs_f64() * 1000.0);
        println!();
    }

    let (submitted, retired) = ctx.queue().counters();
    println!("Batches: {} submitted, {} retired", submitted, retired);
    Ok(())
}

fn print_example_config() {
    let config = SessionConfig::default();

    println!("Example configuration (config.json):");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing config: {}", e),
    }
}
