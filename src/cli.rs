use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Number of headless outputs to create.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=16))]
    pub outputs: u32,
    /// Quit after this many frames were presented over all outputs (0 runs until interrupted).
    #[arg(long, default_value_t = 0)]
    pub frames: u64,
    /// Mode of the headless outputs, as WIDTHxHEIGHT.
    #[arg(long, default_value = "1280x720", value_parser = parse_size)]
    pub size: (u16, u16),
}

fn parse_size(s: &str) -> Result<(u16, u16), String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| String::from("expected WIDTHxHEIGHT"))?;
    let w: u16 = w.parse().map_err(|_| format!("invalid width {w:?}"))?;
    let h: u16 = h.parse().map_err(|_| format!("invalid height {h:?}"))?;
    if w == 0 || h == 0 {
        return Err(String::from("size must be positive"));
    }
    Ok((w, h))
}
