use std::env;
use std::process;

use media_bridge::clock::monotonic_timestamp_ns;
use media_bridge::control::api;
use media_bridge::device::media_devices;
use media_bridge::{AudioCodecFactory, BridgeConfig};

fn print_devices() {
    let status = api::get_status(media_devices());
    println!("Backend     : {}", status.backend);
    println!("Monotonic   : {} ns", monotonic_timestamp_ns());
    let mut failed = false;
    for kind in status.kinds {
        println!("{}:", kind.kind.label());
        if let Some(err) = kind.error {
            println!("  error: {err}");
            failed = true;
            continue;
        }
        if kind.devices.is_empty() {
            println!("  (none)");
        }
        let default = kind.default.as_ref().map(|d| d.descriptor.clone());
        for device in &kind.devices {
            let marker = if Some(&device.descriptor) == default.as_ref() { "*" } else { " " };
            println!("  {marker} {} [{}]", device.name, device.descriptor);
            for cap in &device.capabilities {
                println!(
                    "      {}x{} @ {} fps {:?}",
                    cap.width, cap.height, cap.max_fps, cap.fourcc
                );
            }
        }
    }
    if failed {
        process::exit(1);
    }
}

fn print_codecs() {
    let factory = AudioCodecFactory::from_config(&BridgeConfig::from_env());
    for codec in factory.list_supported_codecs() {
        println!(
            "{:<12} {} Hz, {} ch, {} bps",
            codec.format.name, codec.info.sample_rate, codec.info.num_channels, codec.info.bitrate_bps
        );
    }
}

fn main() {
    let mut args = env::args().skip(1);
    if let Some(arg) = args.next() {
        match arg.as_str() {
            "--list" | "-l" => {
                print_devices();
                return;
            }
            "--codecs" | "-c" => {
                print_codecs();
                return;
            }
            "--help" | "-h" => {
                println!(
                    "Usage: mediactl [--list | --codecs]\n\nWithout arguments the interactive device console launches."
                );
                return;
            }
            other => {
                eprintln!("mediactl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    if let Err(err) = media_bridge::control::ui::run() {
        eprintln!("mediactl: {err}");
        process::exit(1);
    }
}
