//! Request-response codec for block exchange.

use std::io;

use futures::prelude::*;
use libp2p::StreamProtocol;
use libp2p::request_response::Codec;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::message::{BlockRequest, BlockResponse};

/// Protocol name for block transfers.
pub const BLOCK_PROTOCOL: StreamProtocol = StreamProtocol::new("/weft/blocks/1.0.0");

/// Largest request or response accepted on the wire.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Postcard codec for [`BlockRequest`] / [`BlockResponse`].
///
/// Each stream carries exactly one message and is closed after writing,
/// so no length prefix is needed. Reads stop one byte past the cap.
#[derive(Debug, Clone, Default)]
pub struct BlockCodec;

async fn read_capped<T, M>(io: &mut T) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    let mut buf = Vec::new();
    io.take(MAX_MESSAGE_SIZE as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message exceeds {MAX_MESSAGE_SIZE} bytes"),
        ));
    }
    postcard::from_bytes(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

async fn write_one<T, M>(io: &mut T, msg: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let buf = postcard::to_allocvec(msg)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message exceeds {MAX_MESSAGE_SIZE} bytes"),
        ));
    }
    io.write_all(&buf).await?;
    io.close().await
}

#[async_trait::async_trait]
impl Codec for BlockCodec {
    type Protocol = StreamProtocol;
    type Request = BlockRequest;
    type Response = BlockResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_capped(io).await
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_capped(io).await
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
        write_one(io, &req).await
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
        write_one(io, &res).await
    }
}
