/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Arg, Command};
use tracing_subscriber::EnvFilter;

use trellis_service::device::DummyDevice;
use trellis_service::settings::Settings;

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Command::new("trellis")
        .arg(Arg::new("config").short('c').long("config").value_name("PATH").default_value("trellis.conf"))
        .subcommand_required(true)
        .subcommand(Command::new("service").about("Run the mesh datapath service"))
        .subcommand(Command::new("version").about("Print version"))
        .get_matches();

    match args.subcommand() {
        Some(("version", _)) => {
            println!(
                "{}.{}.{}",
                trellis_mesh::VERSION_MAJOR,
                trellis_mesh::VERSION_MINOR,
                trellis_mesh::VERSION_REVISION
            );
        }
        Some(("service", _)) => {
            let config_path = args.get_one::<String>("config").unwrap();
            let settings = match Settings::load(config_path) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("cannot read {}: {}", config_path, e);
                    std::process::exit(1);
                }
            };
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let local = tokio::task::LocalSet::new();
            // The device driver is out of scope here: frames written by the
            // mesh are discarded and nothing feeds the ingress channel. A
            // deployment replaces DummyDevice and the channel with a TUN/TAP
            // driver task.
            let (_device_tx, device_rx) = tokio::sync::mpsc::channel(64);
            let result = local.block_on(&runtime, trellis_service::service::run(settings, DummyDevice, device_rx));
            if let Err(e) = result {
                eprintln!("fatal: {}", e);
                std::process::exit(1);
            }
        }
        _ => unreachable!(),
    }
}
