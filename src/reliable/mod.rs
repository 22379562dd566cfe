mod kcp_stream;

pub use kcp_stream::KcpStream;
