//! The VCI collaboration hub: binds the listening ports, loads the
//! configured plug-in protocols, and runs the dispatcher until `quit`.
//!
//! Exit codes: 0 after an operator `quit`, 1 when the listening ports
//! cannot be bound, 2 on configuration errors.

mod config;

use agora::server::AgoraServer;
use clap::{Arg, Command};
use conduit::dispatch::Dispatcher;
use conduit::plugin::{make_version, version_major, ServerPlugin};
use conduit::server::{Server, ServerConfig};
use crate::config::Config;
use keel::logging;
use koinonia::server::KoinoniaServer;
use std::fs;
use std::process::exit;

fn main() {
    let matches = Command::new("VCI Collaboration Hub")
        .version("1.0")
        .about("Runs the collaboration server.")
        .arg(
            Arg::new("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches
        .get_one::<String>("CONFIG_FILE")
        .expect("CONFIG_FILE is required");

    let config: Config = match fs::File::open(config_file_path)
        .map_err(|err| err.to_string())
        .and_then(|file| serde_json::from_reader(file).map_err(|err| err.to_string()))
    {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error reading config file {}: {}", config_file_path, err);
            exit(2);
        }
    };

    let log = logging::init();
    logging::info!(log, "starting collaboration hub";
                   "name" => &config.name, "port" => config.port);

    let mut server = match Server::new(
        ServerConfig {
            name: config.name.clone(),
            port: config.port,
            password: config.password.clone().unwrap_or_default(),
        },
        &log,
    ) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "cannot bind listening ports";
                            "port" => config.port, "error" => %err);
            exit(1);
        }
    };

    // The loader probes these factories when a protocol is requested by
    // name and major version.
    let factory_log = log.clone();
    server.registry_mut().add_factory(move |name, version| {
        match (name, version_major(version)) {
            (koinonia::PROTOCOL_NAME, 1) => {
                Some(Box::new(KoinoniaServer::new(&factory_log)) as Box<dyn ServerPlugin>)
            }
            (agora::PROTOCOL_NAME, 1) => {
                Some(Box::new(AgoraServer::new(&factory_log)) as Box<dyn ServerPlugin>)
            }
            _ => None,
        }
    });

    for spec in &config.plugins {
        if !server.load_plugin(&spec.name, make_version(spec.version, 0)) {
            logging::error!(log, "cannot load configured plug-in";
                            "plugin" => &spec.name, "version" => spec.version);
            exit(2);
        }
    }

    let mut dispatcher: Dispatcher<Server> = match Dispatcher::new() {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            logging::error!(log, "cannot create event dispatcher"; "error" => %err);
            exit(1);
        }
    };
    if let Err(err) = dispatcher.watch_process_signals() {
        logging::warn!(log, "cannot install signal handlers"; "error" => %err);
    }

    server.attach(&mut dispatcher);
    server.attach_console(&mut dispatcher, config.command_pipe.as_deref());

    logging::info!(log, "serving"; "port" => config.port);
    dispatcher.run(&mut server);

    logging::info!(log, "hub stopped");
    exit(0);
}
