use std::error::Error;
use std::{env, fs, process};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wasm_decompiler::decompile::DecompilerKind;

fn main() {
	tracing_subscriber::registry()
		.with(tracing_subscriber::filter::LevelFilter::INFO)
		.with(tracing_tree::HierarchicalLayer::new(2))
		.init();

	if let Err(err) = run() {
		eprintln!("{}", err);
		process::exit(1);
	}
}

fn run() -> Result<(), Box<dyn Error>> {
	let mut args = env::args().skip(1);
	let path = args.next().ok_or("usage: wasm_decompiler <module.wasm> [flat|structured]")?;
	let kind = match args.next().as_deref() {
		None | Some("flat") => DecompilerKind::Flat,
		Some("structured") => DecompilerKind::Structured,
		Some(other) => return Err(format!("unknown renderer: {}", other).into()),
	};

	let bytecode = fs::read(path)?;
	let output = wasm_decompiler::decompile_module(bytecode, kind)?;
	print!("{}", output);
	Ok(())
}
