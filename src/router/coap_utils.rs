use coap_lite::{MessageClass, MessageType, Packet};

/// Reply to a "CoAP ping" (an empty Confirmable message) with a Reset.
pub fn new_pong_message(ping: &Packet) -> Packet {
    let mut pong = Packet::new();
    pong.header.set_version(1);
    pong.header.set_type(MessageType::Reset);
    pong.header.code = MessageClass::Empty;
    pong.header.message_id = ping.header.message_id;
    pong
}

/// Empty ACK used to acknowledge a Confirmable message whose response will follow separately.
pub fn new_empty_ack(message_id: u16) -> Packet {
    let mut ack = Packet::new();
    ack.header.set_version(1);
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = message_id;
    ack
}
