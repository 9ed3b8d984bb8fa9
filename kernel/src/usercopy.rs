use system::error::SysError;
use system::message::{MESSAGE_WORDS, Message};

/// Trusted copy-in/copy-out facility provided outside this core. The
/// syscall layer goes through it before any user-supplied address is
/// touched.
pub trait UserCopy: Send + Sync {
    fn copy_in(&self, user_addr: usize, dst: &mut [u8]) -> Result<(), SysError>;
    fn copy_out(&self, user_addr: usize, src: &[u8]) -> Result<(), SysError>;
}

pub fn read_u32(user: &dyn UserCopy, addr: usize) -> Result<u32, SysError> {
    let mut bytes = [0u8; 4];
    user.copy_in(addr, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn write_u32(user: &dyn UserCopy, addr: usize, value: u32) -> Result<(), SysError> {
    user.copy_out(addr, &value.to_le_bytes())
}

pub fn read_message(user: &dyn UserCopy, addr: usize) -> Result<Message, SysError> {
    let mut bytes = [0u8; 8 * (1 + MESSAGE_WORDS)];
    user.copy_in(addr, &mut bytes)?;
    let mut words = [0u64; MESSAGE_WORDS];
    let label = u64::from_le_bytes(bytes[0..8].try_into().expect("slice is 8 bytes"));
    for (i, word) in words.iter_mut().enumerate() {
        let offset = 8 + i * 8;
        *word = u64::from_le_bytes(
            bytes[offset..offset + 8]
                .try_into()
                .expect("slice is 8 bytes"),
        );
    }
    Ok(Message { label, words })
}

pub fn write_message(user: &dyn UserCopy, addr: usize, message: &Message) -> Result<(), SysError> {
    let mut bytes = [0u8; 8 * (1 + MESSAGE_WORDS)];
    bytes[0..8].copy_from_slice(&message.label.to_le_bytes());
    for (i, word) in message.words.iter().enumerate() {
        let offset = 8 + i * 8;
        bytes[offset..offset + 8].copy_from_slice(&word.to_le_bytes());
    }
    user.copy_out(addr, &bytes)
}
