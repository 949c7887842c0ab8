pub const START: u8 = 0x02u8;
pub const ACK: u8 = 0x06u8;
pub const NAK: u8 = 0x15u8;

// PLM -> Host commands
pub const STANDARD_INSTEON_RECV: u8 = 0x50u8;
pub const EXTENDED_INSTEON_RECV: u8 = 0x51u8;
pub const X10_RECV: u8 = 0x52u8;
pub const ALL_LINK_COMPLETE: u8 = 0x53u8;
pub const BUTTON_EVENT: u8 = 0x54u8;
pub const USER_RESET: u8 = 0x55u8;
pub const ALL_LINK_CLEANUP_FAILURE: u8 = 0x56u8;
pub const ALL_LINK_RECORD: u8 = 0x57u8;
pub const ALL_LINK_CLEANUP_STATUS: u8 = 0x58u8;
pub const GETIMINFO: u8 = 0x60u8;

// Host -> PLM commands
pub const ALL_LINK_SEND: u8 = 0x61u8;
pub const INSTEON_SEND: u8 = 0x62u8;
pub const X10_SEND: u8 = 0x63u8;
pub const START_ALL_LINK: u8 = 0x64u8;
pub const CANCEL_ALL_LINK: u8 = 0x65u8;
pub const SET_HOST_CATEGORY: u8 = 0x66u8;
pub const RESET: u8 = 0x67u8;
pub const SET_ACK_BYTE: u8 = 0x68u8;
pub const GET_FIRST_ALL_LINK_RECORD: u8 = 0x69u8;
pub const GET_NEXT_ALL_LINK_RECORD: u8 = 0x6au8;
pub const SET_CONFIG: u8 = 0x6bu8;
pub const GET_SENDER_ALL_LINK_RECORD: u8 = 0x6cu8;
pub const LED_ON: u8 = 0x6du8;
pub const LED_OFF: u8 = 0x6eu8;
pub const MANAGE_ALL_LINK_RECORD: u8 = 0x6fu8;
pub const SET_NAK_BYTE: u8 = 0x70u8;
pub const SET_NAK_TWO_BYTES: u8 = 0x71u8;
pub const RF_SLEEP: u8 = 0x72u8;
pub const GET_CONFIG: u8 = 0x73u8;

/// Number of bytes following `START` and the command byte, including the
/// trailing ACK/NAK the modem appends when echoing host commands.
/// An extended `INSTEON_SEND` echo carries `EXTENDED_PAYLOAD_LEN` more.
pub fn body_len(command: u8) -> Option<usize> {
    let len = match command {
        STANDARD_INSTEON_RECV => 9,
        EXTENDED_INSTEON_RECV => 23,
        X10_RECV => 2,
        ALL_LINK_COMPLETE => 8,
        BUTTON_EVENT => 1,
        USER_RESET => 0,
        ALL_LINK_CLEANUP_FAILURE => 5,
        ALL_LINK_RECORD => 8,
        ALL_LINK_CLEANUP_STATUS => 1,
        GETIMINFO => 7,
        ALL_LINK_SEND => 4,
        INSTEON_SEND => 7,
        X10_SEND => 3,
        START_ALL_LINK => 3,
        CANCEL_ALL_LINK => 1,
        SET_HOST_CATEGORY => 4,
        RESET => 1,
        SET_ACK_BYTE => 2,
        GET_FIRST_ALL_LINK_RECORD => 1,
        GET_NEXT_ALL_LINK_RECORD => 1,
        SET_CONFIG => 2,
        GET_SENDER_ALL_LINK_RECORD => 1,
        LED_ON => 1,
        LED_OFF => 1,
        MANAGE_ALL_LINK_RECORD => 10,
        SET_NAK_BYTE => 2,
        SET_NAK_TWO_BYTES => 3,
        RF_SLEEP => 1,
        GET_CONFIG => 4,
        _ => return None,
    };
    Some(len)
}

// Linking modes
pub const LINK_MODE_RESPONDER: u8 = 0x00;
pub const LINK_MODE_CONTROLLER: u8 = 0x01;
pub const LINK_MODE_AUTO: u8 = 0x03;
pub const LINK_MODE_DELETE: u8 = 0xff;

// INSTEON message layout
pub const STANDARD_MSG_LEN: usize = 9;
pub const EXTENDED_MSG_LEN: usize = 23;
pub const EXTENDED_PAYLOAD_LEN: usize = 14;

// All-link database layout
pub const LINK_RECORD_LEN: usize = 8;
pub const FIRST_RECORD_ADDRESS: u16 = 0x0fff;
pub const MAX_LINK_RECORDS: usize = 512;

// ReadWriteALDB (0x2f) payload operations
pub const ALDB_READ: u8 = 0x00;
pub const ALDB_RECORD_RESPONSE: u8 = 0x01;
pub const ALDB_WRITE: u8 = 0x02;

/// cmd2 of a GetEngineVersion NAK from an I2Cs device that is not linked
/// to the modem.
pub const ENGINE_NOT_LINKED: u8 = 0xff;
