use once_cell::sync::Lazy;

/// Default capacity, in elements, of one hyperqueue segment.
pub(crate) const DEFAULT_SEGMENT: usize = 1024;

pub(crate) struct Config {
  pub(crate) nthreads: usize,
}

/// Runtime configuration, resolved from the environment on first use.
///
/// `NUM_THREADS` selects the worker count (default 2, `0` means one worker
/// per logical CPU). `PRINT_VERSION` prints the build configuration banner
/// when non-zero and exits afterwards when 2 or more.
pub(crate) static CONFIG: Lazy<Config> = Lazy::new(|| {
  let pv = std::env::var("PRINT_VERSION")
    .ok()
    .and_then(|s| s.parse::<u32>().ok())
    .unwrap_or(0);
  if pv > 0 {
    print_banner();
    if pv > 1 {
      std::process::exit(0);
    }
  }

  let nthreads = std::env::var("NUM_THREADS")
    .ok()
    .and_then(|s| s.parse::<usize>().ok())
    .unwrap_or(2);
  let nthreads = if nthreads == 0 {
    std::cmp::max(1, num_cpus::get())
  } else {
    nthreads
  };

  Config { nthreads }
});

fn print_banner() {
  eprintln!(
    "cygnet {}\nConfiguration:\n\ttracing = {}\n\tnorename = {}\n\tdefault_segment = {}",
    env!("CARGO_PKG_VERSION"),
    cfg!(feature = "tracing") as u8,
    cfg!(feature = "norename") as u8,
    DEFAULT_SEGMENT,
  );
}
