//! Operator console: whitespace-separated commands read from stdin and
//! optionally from a named FIFO. Commands run on the dispatcher thread
//! and must return promptly.

use crate::dispatch::{Api, Dispatcher, Event, Mask};
use crate::plugin::make_version;
use crate::server::Server;
use keel::logging;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

pub struct Console {
    stdin_buffer: String,
    pipe_buffer: String,
    // Opened read+write so the FIFO never reports end-of-file when a
    // writer disappears.
    pipe_file: Option<File>,
}

impl Console {
    pub fn new() -> Console {
        Console {
            stdin_buffer: String::new(),
            pipe_buffer: String::new(),
            pipe_file: None,
        }
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Drains whatever is readable from the descriptor without blocking.
fn drain_fd(fd: RawFd) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let count = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if count > 0 {
            collected.extend_from_slice(&chunk[..count as usize]);
        } else {
            break;
        }
    }
    collected
}

impl Server {
    /// Registers the console inputs on the dispatcher.
    pub fn attach_console(
        &mut self,
        dispatcher: &mut Dispatcher<Server>,
        command_pipe: Option<&Path>,
    ) {
        set_nonblocking(0);
        dispatcher.add_io_listener(0, Mask::READ, |server, api, event| {
            if let Event::Io(mask) = event {
                if mask.readable() {
                    server.console_input(api, 0, false);
                }
            }
            false
        });

        if let Some(path) = command_pipe {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => {
                    let fd = file.as_raw_fd();
                    self.console.pipe_file = Some(file);
                    dispatcher.add_io_listener(fd, Mask::READ, move |server, api, event| {
                        if let Event::Io(mask) = event {
                            if mask.readable() {
                                server.console_input(api, fd, true);
                            }
                        }
                        false
                    });
                }
                Err(err) => {
                    logging::warn!(self.core.log, "cannot open command pipe";
                                   "path" => %path.display(), "error" => %err);
                }
            }
        }
    }

    fn console_input(&mut self, api: &mut Api<Server>, fd: RawFd, from_pipe: bool) {
        let bytes = drain_fd(fd);
        let text = String::from_utf8_lossy(&bytes);
        if from_pipe {
            self.console.pipe_buffer.push_str(&text);
        } else {
            self.console.stdin_buffer.push_str(&text);
        }

        loop {
            let buffer = if from_pipe {
                &mut self.console.pipe_buffer
            } else {
                &mut self.console.stdin_buffer
            };
            let line = match buffer.find('\n') {
                Some(newline) => {
                    let line: String = buffer[..newline].to_owned();
                    buffer.replace_range(..=newline, "");
                    line
                }
                None => break,
            };
            self.dispatch_command(api, line.trim());
        }
        self.flush_masks(api);
    }

    fn dispatch_command(&mut self, api: &mut Api<Server>, line: &str) {
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(command) => command,
            None => return,
        };
        let args: Vec<&str> = parts.collect();

        match command {
            "setPassword" => {
                let password = args.first().copied().unwrap_or("").to_owned();
                let disabled = password.is_empty();
                self.core.set_password(password);
                println!(
                    "Session password {}",
                    if disabled { "disabled" } else { "updated" }
                );
            }
            "netstat" => {
                for (id, name, unsent, unread) in self.core.netstat() {
                    println!(
                        "client {:5}  {:<32}  unsent {:8}  unread {:8}",
                        id, name, unsent, unread
                    );
                }
                println!("UDP datagrams queued: {}", self.core.udp_queued());
            }
            "listClients" => {
                for id in self.core.session_order.iter() {
                    if let Some(sess) = self.core.sessions.get(id) {
                        println!(
                            "client {:5}  {:<32}  {}  udp: {}",
                            id,
                            sess.name,
                            sess.address,
                            if sess.udp_address.is_some() { "yes" } else { "no" }
                        );
                    }
                }
            }
            "disconnectClient" => match args.first().and_then(|arg| arg.parse().ok()) {
                Some(id) => {
                    if self.core.sessions.contains_key(&id) {
                        self.force_disconnect(api, id);
                        println!("Client {} disconnected", id);
                    } else {
                        println!("No client with ID {}", id);
                    }
                }
                None => println!("Usage: disconnectClient <id>"),
            },
            "listPlugins" => {
                for index in 0..self.plugins.len() {
                    let entry = self.plugins.entry(index);
                    println!(
                        "plugin {:3}  {:<16}  version {}.{}  bases {}/{}{}",
                        index,
                        entry.plugin.name(),
                        entry.plugin.version() >> 16,
                        entry.plugin.version() & 0xFFFF,
                        entry.client_base,
                        entry.server_base,
                        if entry.active { "" } else { "  (unloaded)" }
                    );
                }
            }
            "loadPlugin" => {
                let name = args.first().copied();
                let major = args.get(1).and_then(|arg| arg.parse::<u16>().ok());
                match (name, major) {
                    (Some(name), Some(major)) => {
                        if self.load_plugin(name, make_version(major, 0)) {
                            println!("Plug-in {} loaded", name);
                        } else {
                            println!("Cannot load plug-in {} version {}", name, major);
                        }
                    }
                    _ => println!("Usage: loadPlugin <name> <major>"),
                }
            }
            "unloadPlugin" => match args.first() {
                Some(&name) => match self.plugins.find_by_name(name) {
                    Some(index) => {
                        let participants = self
                            .core
                            .sessions
                            .values()
                            .filter(|sess| sess.plugin_indices.contains(&index))
                            .count();
                        if participants == 0 {
                            self.plugins.unload(index);
                            println!("Plug-in {} unloaded", name);
                        } else {
                            println!("Plug-in {} is in use by {} clients", name, participants);
                        }
                    }
                    None => println!("No plug-in named {}", name),
                },
                None => println!("Usage: unloadPlugin <name>"),
            },
            "quit" => {
                logging::info!(self.core.log, "shutting down on operator request");
                api.stop();
            }
            _ => {
                let mut handled = false;
                for index in 0..self.plugins.len() {
                    if self
                        .plugins
                        .entry_mut(index)
                        .plugin
                        .console_command(&mut self.core, command, &args)
                    {
                        handled = true;
                        break;
                    }
                }
                if !handled {
                    println!("Unknown command {}", command);
                }
            }
        }
    }
}
