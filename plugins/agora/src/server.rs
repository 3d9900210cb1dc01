//! Server half of the audio chat protocol: routes audio packets by
//! destination client ID with UDP→TCP fallback, re-stamping the header
//! in place.

use crate::*;
use conduit::error::{ErrorKind, NetError, NetResult};
use conduit::plugin::{Continuation, HandlerAction, ServerPlugin};
use conduit::server::ServerCore;
use conduit::wire::cursor::{MessageEditor, MessageReader, MessageWriter, WireRead};
use conduit::wire::{BufferRef, MessageBuffer};
use conduit::{ClientId, MessageId};
use keel::logging::{self, Logger};

/// Per-client encoder parameters, stored in the session's plug-in
/// state slot.
struct AgoraClientState {
    sample_rate: u32,
    packet_frames: u32,
}

/// Continuation for an audio packet arriving on the TCP stream: the
/// reply message is built up front and filled chunk by chunk.
struct AudioPacketCont {
    destination: ClientId,
    reply: MessageWriter,
}

pub struct AgoraServer {
    log: Logger,
    client_base: MessageId,
    server_base: MessageId,
    index: usize,
    clients: Vec<ClientId>,
}

impl AgoraServer {
    pub fn new(log: &Logger) -> AgoraServer {
        AgoraServer {
            log: log.new(logging::o!("plugin" => PROTOCOL_NAME)),
            client_base: 0,
            server_base: 0,
            index: 0,
            clients: Vec::new(),
        }
    }

    fn handle_connect_request(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
    ) -> NetResult<HandlerAction> {
        let (sample_rate, packet_frames) = {
            let socket = core.socket_mut(client_id)?;
            (socket.read_u32()?, socket.read_u32()?)
        };

        // Announce the new participant to the incumbents and vice
        // versa.
        let notification = build_connect_notification(
            self.server_base,
            client_id,
            sample_rate,
            packet_frames,
        );
        for &other in &self.clients {
            core.queue_message(other, notification.clone());

            if let Some(state) = core
                .plugin_state_mut(other, self.index)
                .and_then(|state| state.downcast_ref::<AgoraClientState>())
            {
                let other_notification = build_connect_notification(
                    self.server_base,
                    other,
                    state.sample_rate,
                    state.packet_frames,
                );
                core.queue_message(client_id, other_notification);
            }
        }

        core.set_plugin_state(
            client_id,
            self.index,
            Box::new(AgoraClientState {
                sample_rate,
                packet_frames,
            }),
        );
        self.clients.push(client_id);

        logging::info!(self.log, "audio client joined";
                       "client_id" => client_id,
                       "sample_rate" => sample_rate,
                       "packet_frames" => packet_frames);
        Ok(HandlerAction::Done)
    }

    fn handle_audio_packet(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        let mut cont = match cont {
            Some(boxed) => *boxed
                .downcast::<AudioPacketCont>()
                .map_err(|_| NetError::Fatal(ErrorKind::TypeMismatch))?,
            None => {
                let (destination, sequence, length) = {
                    let socket = core.socket_mut(client_id)?;
                    (socket.read_u16()?, socket.read_u16()?, socket.read_u16()?)
                };
                // Build the forwarded message up front with the source
                // client substituted for the destination.
                let mut reply = MessageWriter::with_capacity(
                    self.server_base + AUDIO_PACKET_REPLY,
                    AUDIO_PACKET_PREFIX + length as usize,
                );
                reply.write_u16(client_id)?;
                reply.write_u16(sequence)?;
                reply.write_u16(length)?;
                AudioPacketCont {
                    destination,
                    reply,
                }
            }
        };

        // Copy whatever part of the packet is buffered.
        loop {
            let socket = core.socket_mut(client_id)?;
            let chunk = socket.unread().min(cont.reply.space());
            if chunk == 0 {
                break;
            }
            let mut bytes = vec![0u8; chunk];
            socket.fetch(&mut bytes)?;
            cont.reply.write_bytes(&bytes)?;
        }

        if !cont.reply.eof() {
            return Ok(HandlerAction::NeedMore {
                min_unread: 1,
                cont: Box::new(cont),
            });
        }

        let AudioPacketCont { destination, reply } = cont;
        self.route_packet(core, client_id, destination, reply.into_shared());
        Ok(HandlerAction::Done)
    }

    fn handle_udp_audio_packet(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        reader: &mut MessageReader,
    ) -> NetResult<()> {
        if reader.unread() < AUDIO_PACKET_PREFIX {
            return Err(NetError::Fatal(ErrorKind::Truncated));
        }
        let destination = reader.read_u16()?;
        let sequence = reader.read_u16()?;
        let length = reader.read_u16()?;
        if reader.unread() != length as usize {
            return Err(NetError::Fatal(ErrorKind::Truncated));
        }

        // Re-stamp the datagram in place: message ID, source client ID
        // and, if the sender's byte order differs, the header scalars.
        let mut message =
            MessageBuffer::create(self.server_base + AUDIO_PACKET_REPLY, reader.unread() + AUDIO_PACKET_PREFIX);
        {
            let mut editor = MessageEditor::new(&mut message);
            editor.write_u16(client_id)?;
            editor.write_u16(sequence)?;
            editor.write_u16(length)?;
            editor.write_bytes(reader.remaining())?;
        }

        self.route_packet(core, client_id, destination, message.into_shared());
        Ok(())
    }

    fn route_packet(
        &mut self,
        core: &mut ServerCore,
        source: ClientId,
        destination: ClientId,
        message: BufferRef,
    ) {
        if destination == 0 {
            // Broadcast to every participant except the source.
            for &other in &self.clients {
                if other != source {
                    core.queue_udp_message_fallback(other, message.clone());
                }
            }
        } else if self.clients.contains(&destination) {
            core.queue_udp_message_fallback(destination, message);
        }
    }
}

fn build_connect_notification(
    server_base: MessageId,
    client_id: ClientId,
    sample_rate: u32,
    packet_frames: u32,
) -> BufferRef {
    let mut writer = MessageWriter::with_capacity(
        server_base + CONNECT_NOTIFICATION,
        CONNECT_NOTIFICATION_SIZE,
    );
    writer
        .write_u16(client_id)
        .and_then(|_| writer.write_u32(sample_rate))
        .and_then(|_| writer.write_u32(packet_frames))
        .expect("Notification size mismatch");
    writer.into_shared()
}

impl ServerPlugin for AgoraServer {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    fn num_client_messages(&self) -> u16 {
        NUM_CLIENT_MESSAGES
    }

    fn num_server_messages(&self) -> u16 {
        NUM_SERVER_MESSAGES
    }

    fn set_message_bases(&mut self, client_base: MessageId, server_base: MessageId) {
        self.client_base = client_base;
        self.server_base = server_base;
    }

    fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    fn start(&mut self, _core: &mut ServerCore) {}

    fn client_connected(&mut self, _core: &mut ServerCore, _client_id: ClientId) {
        // Participation starts when the client sends its encoder
        // parameters.
    }

    fn client_disconnected(&mut self, core: &mut ServerCore, client_id: ClientId) {
        self.clients.retain(|&client| client != client_id);
        core.take_plugin_state(client_id, self.index);
    }

    fn tcp_min_unread(&self, message_index: u16) -> usize {
        match message_index {
            CONNECT_REQUEST => CONNECT_REQUEST_SIZE,
            AUDIO_PACKET_REQUEST => AUDIO_PACKET_PREFIX,
            _ => 0,
        }
    }

    fn handle_tcp_message(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        message_index: u16,
        cont: Option<Continuation>,
    ) -> NetResult<HandlerAction> {
        match message_index {
            CONNECT_REQUEST => self.handle_connect_request(core, client_id),
            AUDIO_PACKET_REQUEST => self.handle_audio_packet(core, client_id, cont),
            _ => Err(NetError::Fatal(ErrorKind::UnknownMessage(
                self.client_base + message_index,
            ))),
        }
    }

    fn handle_udp_message(
        &mut self,
        core: &mut ServerCore,
        client_id: ClientId,
        message_index: u16,
        reader: &mut MessageReader,
    ) -> NetResult<()> {
        match message_index {
            AUDIO_PACKET_REQUEST => self.handle_udp_audio_packet(core, client_id, reader),
            _ => Err(NetError::Fatal(ErrorKind::UnknownMessage(
                self.client_base + message_index,
            ))),
        }
    }

    fn console_command(&mut self, _core: &mut ServerCore, command: &str, _args: &[&str]) -> bool {
        if command == "agoraClients" {
            for &client in &self.clients {
                println!("audio client {}", client);
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_notification_layout() {
        let notification = build_connect_notification(20, 7, 48000, 960);
        assert_eq!(notification.message_id(), 20 + CONNECT_NOTIFICATION);

        let mut reader = MessageReader::over_body(&notification, false);
        assert_eq!(reader.read_u16().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 48000);
        assert_eq!(reader.read_u32().unwrap(), 960);
        assert_eq!(reader.unread(), 0);
    }
}
