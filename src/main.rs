use memdyld::dyld::dlopen;
use memdyld::{Image, LinkContext};
use std::path::PathBuf;
use std::{env, process::exit};
use tracing_subscriber::EnvFilter;

struct Opts {
    /// Link context built from the environment and flags.
    ctx: LinkContext,

    /// Whether to call resolver functions for stub-and-resolver exports.
    run_resolvers: bool,

    /// The dylib to load.
    image: PathBuf,

    /// Symbols to look up; every export is listed when empty.
    symbols: Vec<String>,
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "usage: memdyld [--relaxed] [--print-segments] [--print-bindings] \
             [--protect-segments] [--run-resolvers] <dylib> [symbol...]"
        );
        exit(1);
    }
    let opts = parse_opts(&args);

    let image = match dlopen::open(&opts.image, &opts.ctx) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("memdyld: {}: {}", opts.image.display(), e);
            exit(1);
        }
    };
    println!(
        "{} loaded at 0x{:x} (slide 0x{:x})",
        opts.image.display(),
        image.base_address(),
        image.slide()
    );

    let mut failed = false;
    if opts.symbols.is_empty() {
        match image.exports() {
            Ok(exports) => {
                for (name, symbol) in exports {
                    let name = name.strip_prefix('_').unwrap_or(&name);
                    match image.exported_symbol_address(&opts.ctx, &symbol, opts.run_resolvers) {
                        Ok(address) => print_symbol(&image, name, address),
                        Err(e) => println!("{} -> {}", name, e),
                    }
                }
            }
            Err(e) => {
                eprintln!("memdyld: cannot list exports: {}", e);
                failed = true;
            }
        }
    }
    for name in &opts.symbols {
        match lookup(&image, &opts, name) {
            Ok(address) => print_symbol(&image, name, address),
            Err(e) => {
                eprintln!("memdyld: {}: {}", name, e);
                failed = true;
            }
        }
    }

    dlopen::close(image);
    if failed {
        exit(1);
    }
}

fn lookup(image: &Image, opts: &Opts, name: &str) -> memdyld::Result<usize> {
    if !opts.run_resolvers {
        return dlopen::symbol_address(image, name, &opts.ctx);
    }
    let symbol = image
        .find_shallow_exported_symbol(&format!("_{}", name))?
        .ok_or_else(|| memdyld::Error::SymbolNotFound(name.to_string()))?;
    image.exported_symbol_address(&opts.ctx, &symbol, true)
}

fn print_symbol(image: &Image, name: &str, address: usize) {
    let base = image.base_address();
    match address.checked_sub(base) {
        Some(offset) => println!("{} -> 0x{:x} (base+0x{:x})", name, address, offset),
        None => println!("{} -> 0x{:x}", name, address),
    }
}

fn parse_opts(args: &[String]) -> Opts {
    let mut ctx = LinkContext::from_env();
    let mut run_resolvers = false;
    let mut image = None;
    let mut symbols = Vec::new();
    for arg in &args[1..] {
        if image.is_some() {
            symbols.push(arg.clone());
            continue;
        }
        match arg.as_str() {
            "--relaxed" => ctx = ctx.strict_macho_required(false),
            "--print-segments" => ctx = ctx.verbose_mapping(true),
            "--print-bindings" => ctx = ctx.verbose_bind(true),
            "--protect-segments" => ctx = ctx.protect_segments(true),
            "--run-resolvers" => run_resolvers = true,
            flag if flag.starts_with("--") => {
                eprintln!("memdyld: unknown option {}", flag);
                exit(1);
            }
            path => image = Some(absolute(path)),
        }
    }
    let Some(image) = image else {
        eprintln!("memdyld: no dylib given");
        exit(1);
    };
    Opts {
        ctx,
        run_resolvers,
        image,
        symbols,
    }
}

fn absolute(path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        return path;
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
