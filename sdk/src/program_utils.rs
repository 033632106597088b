//! Contains a single utility function for deserializing from [bincode].

use crate::instruction::InstructionError;

/// Maximum over-the-wire size of a Transaction
///   1280 is IPv6 minimum MTU
///   40 bytes is the size of the IPv6 header
///   8 bytes is the size of the fragment header
pub const PACKET_DATA_SIZE: usize = 1280 - 40 - 8;

/// Deserialize with a limit based the maximum amount of data a program can expect to get.
/// This function should be used in place of direct deserialization to help prevent OOM errors
pub fn limited_deserialize<T>(instruction_data: &[u8]) -> Result<T, InstructionError>
where
    T: serde::de::DeserializeOwned,
{
    limited_deserialize_with_limit(instruction_data, PACKET_DATA_SIZE as u64)
}

pub fn limited_deserialize_with_limit<T>(
    instruction_data: &[u8],
    limit: u64,
) -> Result<T, InstructionError>
where
    T: serde::de::DeserializeOwned,
{
    use bincode::Options;
    bincode::options()
        .with_limit(limit)
        .with_fixint_encoding() // As per https://github.com/servo/bincode/issues/333, these two options are needed
        .allow_trailing_bytes() // to retain the behavior of bincode::deserialize with the new `options()` method
        .deserialize_from(instruction_data)
        .map_err(|_| InstructionError::InvalidInstructionData)
}

#[cfg(test)]
mod tests {
    use {super::*, serde_derive::Deserialize};

    #[derive(Deserialize, Debug, PartialEq)]
    enum Foo {
        Bar(Vec<u8>),
    }

    #[test]
    fn test_limited_deserialize() {
        let item = Foo::Bar([1; PACKET_DATA_SIZE - 12].to_vec()); // last 12 bytes are used by enum tag and vec len
        let serialized = bincode::serialize(&(0u32, vec![1u8; PACKET_DATA_SIZE - 12])).unwrap();
        assert_eq!(limited_deserialize::<Foo>(&serialized).unwrap(), item);

        let serialized = bincode::serialize(&(0u32, vec![1u8; PACKET_DATA_SIZE - 11])).unwrap();
        assert_eq!(
            limited_deserialize::<Foo>(&serialized),
            Err(InstructionError::InvalidInstructionData)
        );
    }
}
