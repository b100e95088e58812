//! libp2p request-response codec for the shard protocol

use crate::protocol::{self, ResponseFrame, WireRequest};
use futures::prelude::*;
use libp2p::request_response::Codec;
use libp2p::StreamProtocol;
use std::io;

/// Codec carrying [`WireRequest`] / [`ResponseFrame`] over one stream each
#[derive(Debug, Clone, Default)]
pub struct ShardCodec;

#[async_trait::async_trait]
impl Codec for ShardCodec {
    type Protocol = StreamProtocol;
    type Request = WireRequest;
    type Response = ResponseFrame;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        protocol::read_request(io).await
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        protocol::read_response(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        protocol::write_request(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        protocol::write_response(io, &res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SHARD_PROTOCOL;
    use bytes::Bytes;
    use futures::io::Cursor;
    use obscurefs_core::ContentId;

    #[tokio::test]
    async fn test_codec_send_file() {
        let mut codec = ShardCodec;
        let data = Bytes::from_static(b"codec shard");
        let request = WireRequest::SendFile {
            key: ContentId::from_data(&data),
            value: data,
        };

        let mut wire = Cursor::new(Vec::new());
        codec
            .write_request(&SHARD_PROTOCOL, &mut wire, request.clone())
            .await
            .unwrap();
        let mut wire = Cursor::new(wire.into_inner());
        let decoded = codec.read_request(&SHARD_PROTOCOL, &mut wire).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_codec_rejects_garbage_response() {
        let mut codec = ShardCodec;
        let mut wire = Cursor::new(b"garbage".to_vec());
        let err = codec
            .read_response(&SHARD_PROTOCOL, &mut wire)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
