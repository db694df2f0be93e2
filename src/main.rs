use anyhow::{bail, Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clam_mil::model::{init_model, load_model, save_model, top_k_indices, Rank};
use clam_mil::{ClamConfig, ClamPipeline, EvalReport, FeatureSource, Slide, SlideDir};

const TOP_PATCHES: usize = 5;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 {
        let rest = &args[2..];
        match args[1].as_str() {
            "--init" | "init" => return run_init(rest),
            "--eval" | "eval" => return run_eval(rest),
            "--attention" | "attention" => return run_attention(rest),
            _ => {}
        }
    }

    eprintln!("usage (choose one):");
    eprintln!("  {} --init <config.json|-> <model_out.safetensors> [flags]", args[0]);
    eprintln!(
        "  {} --eval <config.json|-> <model.safetensors> <slides_dir> [results.tsv] [flags]",
        args[0]
    );
    eprintln!(
        "  {} --attention <config.json|-> <model.safetensors> <slides_dir> [flags]",
        args[0]
    );
    eprintln!("flags: --top-k <f> --att-only --no-instance-eval --no-mutex --gated --non-gated");
    eprintln!("       --single-branch --multi-branch --l2-norm");
    bail!("specify a mode: --init, --eval or --attention");
}

fn select_device() -> Device {
    match Device::new_cuda(0) {
        Ok(d) => {
            info!("using device: CUDA(0)");
            d
        }
        Err(e) => {
            info!("CUDA not available ({e}), using CPU");
            Device::Cpu
        }
    }
}

/// First argument is a JSON config path (`-` for defaults); flags override it.
fn config_from_args(args: &[String]) -> Result<(ClamConfig, Vec<String>)> {
    let Some(source) = args.first() else {
        bail!("missing config path (use - for defaults)");
    };
    let mut config = if source == "-" {
        ClamConfig::default()
    } else {
        ClamConfig::from_json_file(Path::new(source))
            .with_context(|| format!("reading config {source}"))?
    };
    let positional = config.apply_args(&args[1..])?;
    Ok((config, positional))
}

fn run_init(args: &[String]) -> Result<()> {
    let (config, positional) = config_from_args(args)?;
    let Some(out) = positional.first() else {
        bail!("--init needs an output model path");
    };
    let device = select_device();
    let (varmap, _) = init_model(&config, &device)?;
    save_model(&varmap, Path::new(out)).with_context(|| format!("saving {out}"))?;
    println!(
        "Initialized {} model (~{} parameters) -> {}",
        describe(&config),
        format_params(count_params(&varmap)),
        out
    );
    Ok(())
}

fn run_eval(args: &[String]) -> Result<()> {
    let (config, positional) = config_from_args(args)?;
    config.ensure_classifies()?;
    if positional.len() < 2 {
        bail!("--eval needs <model.safetensors> <slides_dir> [results.tsv]");
    }
    let results_path = positional.get(2).map(PathBuf::from);
    let (pipeline, slides, mut report) = prepare(config, &positional[0], &positional[1])?;

    for (slide, outcome) in slides.iter().zip(pipeline.run_many(&slides)) {
        match outcome {
            Ok(outcome) => {
                if let Some(p) = outcome.prediction() {
                    report.push(slide.id.as_str(), slide.label, p.predicted_label);
                }
            }
            Err(e) => {
                warn!("{e}");
                report.push_failure(slide.id.as_str());
            }
        }
    }

    println!("{report}");
    if let Some(path) = results_path {
        report
            .write_tsv(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Results saved to {:?}", path);
    }
    Ok(())
}

fn run_attention(args: &[String]) -> Result<()> {
    let (mut config, positional) = config_from_args(args)?;
    config.att_only = true;
    if positional.len() < 2 {
        bail!("--attention needs <model.safetensors> <slides_dir>");
    }
    let (pipeline, slides, _) = prepare(config, &positional[0], &positional[1])?;

    for outcome in pipeline.run_many(&slides) {
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        let rows = outcome.raw_attention().to_vec2::<f32>()?;
        let width = rows.first().map_or(0, |r| r.len());
        println!("{} ({} patches)", outcome.slide_id(), rows.len());
        for col in 0..width {
            let scores: Vec<f32> = rows.iter().map(|r| r[col]).collect();
            let top = top_k_indices(&scores, TOP_PATCHES, Rank::Highest);
            let listed: Vec<String> = top.iter().map(|&i| format!("{i}:{:.4}", scores[i])).collect();
            println!("  column {col}: {}", listed.join(", "));
        }
    }
    Ok(())
}

/// Loads the model and every readable slide. Unreadable slides are logged and counted as failed.
fn prepare(
    config: ClamConfig,
    model_path: &str,
    slides_dir: &str,
) -> Result<(ClamPipeline, Vec<Slide>, EvalReport)> {
    let device = select_device();
    let (_varmap, model) = load_model(Path::new(model_path), &config, &device)
        .with_context(|| format!("loading model {model_path}"))?;
    println!("Model: {} from {}", describe(&config), model_path);

    let source =
        SlideDir::new(slides_dir, device).with_l2_normalize(config.l2_normalize_features);
    let mut report = EvalReport::new(config.n_class);
    let mut slides = Vec::new();
    for id in source
        .slide_ids()
        .with_context(|| format!("listing {slides_dir}"))?
    {
        match source.load(&id) {
            Ok(slide) => slides.push(slide),
            Err(e) => {
                warn!(slide = %id, "skipping unreadable slide: {e}");
                report.push_failure(id);
            }
        }
    }
    info!(slides = slides.len(), dir = slides_dir, "slides loaded");
    let pipeline = ClamPipeline::new(config, model)?;
    Ok((pipeline, slides, report))
}

fn describe(config: &ClamConfig) -> String {
    format!(
        "{} {:?}-branch, {} classes, top-k {}",
        if config.att_gate { "gated" } else { "non-gated" },
        config.branch,
        config.n_class,
        config.top_k_percent
    )
}

fn count_params(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// Format parameter count: <1M → k, <1B → M, ≥1B → B.
fn format_params(n: usize) -> String {
    const K: usize = 1_000;
    const M: usize = 1_000_000;
    const B: usize = 1_000_000_000;
    if n < M {
        format!("{:.1}k", n as f64 / K as f64)
    } else if n < B {
        format!("{:.2}M", n as f64 / M as f64)
    } else {
        format!("{:.2}B", n as f64 / B as f64)
    }
}
