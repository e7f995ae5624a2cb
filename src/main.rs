//! hostprov - host provisioning for virtual machine instances
//!
//! Subnet allocation, NetworkManager bridges, image preparation and KVM
//! checks from the command line.

use hostprov::cli::{Cli, Commands};
use hostprov::error::Result;
use hostprov::hardware::{self, HardwareProbe};
use hostprov::image::ImagePreparer;
use hostprov::manifest::{self, HostprovConfig};
use hostprov::network::{BridgeProvisioner, SubnetAllocator, SystemBus};
use hostprov::process::HostRunner;
use hostprov::MemorySize;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    // Commands that don't require config
    match &cli.command {
        Commands::Completions { shell } => {
            Cli::generate_completion(*shell);
            return Ok(());
        }
        Commands::Arch => {
            match hardware::host_arch() {
                Some(arch) => println!("{}", arch),
                None => println!("unknown ({})", std::env::consts::ARCH),
            }
            return Ok(());
        }
        _ => {}
    }

    let config = manifest::load_or_default(&cli.config)?;
    let runner = HostRunner::new();

    match cli.command {
        Commands::Subnet { bridge } => {
            let bridge = bridge.unwrap_or_else(|| config.network.bridge_name.clone());
            let subnet = SubnetAllocator::new(&runner).get_subnet(&config.network.data_dir, &bridge)?;
            println!("{}", subnet);
        }
        Commands::Bridge { interface } => {
            let bus = SystemBus::connect();
            BridgeProvisioner::new(&bus).create_bridge(&interface)?;
            println!("Bridge created for {}", interface);
        }
        Commands::Resize { image, size } => {
            let size: MemorySize = size.parse()?;
            image_preparer(&runner, &config).resize(&image, size)?;
            println!("Resized {} to {} bytes", image.display(), size.in_bytes());
        }
        Commands::Convert { image } => {
            let path = image_preparer(&runner, &config).convert_to_target_format_if_needed(&image)?;
            println!("{}", path.display());
        }
        Commands::Check => {
            let mut hardware = HardwareProbe::new(&runner).with_device(&config.hardware.device);
            if let Some(dir) = &config.hardware.helper_dir {
                hardware = hardware.with_helper_dir(dir);
            }
            hardware.check_acceleration_support()?;
            hardware.check_acceleration_not_in_use()?;
            println!("KVM acceleration is available");
        }
        Commands::Completions { .. } | Commands::Arch => {}
    }

    Ok(())
}

fn image_preparer<'a>(runner: &'a HostRunner, config: &HostprovConfig) -> ImagePreparer<'a> {
    ImagePreparer::new(runner)
        .with_tool(&config.image.tool)
        .with_timeout(config.image.timeout())
}
