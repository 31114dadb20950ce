/// Types implementing BeanstalkSerialisable can be written back to a client
/// as a complete protocol reply.
pub trait BeanstalkSerialisable {
    /// Encodes the reply, including its trailing CRLF and any data block.
    fn serialise_beanstalk(&self) -> Vec<u8>;
}
