use num_enum::TryFromPrimitive;

/// Reserved opcodes of the RPC protocol. Every other opcode is an application
///  frame and is handed to the dispatch bus undecoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum RpcOpCode {
    /// a call envelope, client to server
    Call = -104,
    /// a reply envelope, server to client
    Reply = -105,
    /// an error notification frame
    ErrorNotification = -777,
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::call(-104, Some(RpcOpCode::Call))]
    #[case::reply(-105, Some(RpcOpCode::Reply))]
    #[case::error(-777, Some(RpcOpCode::ErrorNotification))]
    #[case::application(42, None)]
    fn test_try_from(#[case] raw: i32, #[case] expected: Option<RpcOpCode>) {
        assert_eq!(RpcOpCode::try_from(raw).ok(), expected);
    }
}
