use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

/// A message interface for [services](Service).
///
/// Most commonly, this interface is an enumeration of messages, but it can also be implemented on
/// a single message. For each individual message, this type needs to implement [`FromMessage`].
pub trait Interface: Send + 'static {}

impl Interface for () {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to send message to service")]
pub struct SendError;

/// Response behavior of an [`Interface`] message.
///
/// It defines how a service handles and responds to interface messages, such as through
/// asynchronous responses or fire-and-forget without responding. [`FromMessage`] implementations
/// declare this behavior on the interface.
pub trait MessageResponse {
    /// Sends responses from the service back to the waiting recipient.
    type Sender: Send + 'static;

    /// The type returned from [`Addr::send`] when this response behavior is used.
    type Output;

    /// Returns the response channel for an interface message.
    fn channel() -> (Self::Sender, Self::Output);
}

/// Sends a message response from a service back to the waiting [`Request`].
///
/// The sender can be moved freely and does not block the service. If the request is dropped
/// before the response is sent, sending becomes a no-op.
#[derive(Debug)]
pub struct Sender<T>(oneshot::Sender<T>);

impl<T> Sender<T> {
    /// Sends the response value and closes the [`Request`].
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }

    /// Returns `true` if the request has been dropped.
    pub fn is_canceled(&self) -> bool {
        self.0.is_closed()
    }
}

/// The request when sending an asynchronous message to a service.
///
/// This is a future that resolves to `Result<T, SendError>` once the service has responded. It
/// errors if the service fails to respond, for instance because it shut down.
#[derive(Debug)]
pub struct Request<T>(oneshot::Receiver<T>);

impl<T> Future for Request<T> {
    type Output = Result<T, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map_err(|_| SendError)
    }
}

/// Message response resulting in an asynchronous [`Request`].
///
/// The sender must be placed on the interface message and fulfilled by the service.
pub struct AsyncResponse<T>(PhantomData<T>);

impl<T> fmt::Debug for AsyncResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("AsyncResponse")
    }
}

impl<T: Send + 'static> MessageResponse for AsyncResponse<T> {
    type Sender = Sender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (Sender(tx), Request(rx))
    }
}

/// Message response for fire-and-forget messages with no output.
pub struct NoResponse;

impl fmt::Debug for NoResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("NoResponse")
    }
}

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// Sends a shared message response to a [`Request`] attached to a [`BroadcastChannel`].
///
/// Unlike [`Sender`], this sender can either respond to its own request directly, or be attached
/// to a channel that responds to an arbitrary number of requests at once.
#[derive(Debug)]
pub struct BroadcastSender<T>(oneshot::Sender<T>);

impl<T: Clone> BroadcastSender<T> {
    /// Sends the response value directly to the attached request.
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }
}

/// A channel that resolves any number of attached requests with a single value.
///
/// Senders are attached with [`attach`](Self::attach) while a shared operation is in flight.
/// Calling [`send`](Self::send) resolves all attached requests with clones of the value.
#[derive(Debug)]
pub struct BroadcastChannel<T: Clone> {
    senders: Vec<BroadcastSender<T>>,
}

impl<T: Clone> BroadcastChannel<T> {
    /// Creates an empty channel without attached senders.
    pub fn new() -> Self {
        Self {
            senders: Vec::new(),
        }
    }

    /// Attaches a sender to this channel.
    pub fn attach(&mut self, sender: BroadcastSender<T>) {
        self.senders.push(sender);
    }

    /// Returns the number of requests waiting on this channel.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Returns `true` if no requests are attached.
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Resolves all attached requests with the given value.
    pub fn send(self, value: T) {
        let mut iter = self.senders.into_iter().peekable();
        while let Some(sender) = iter.next() {
            if iter.peek().is_none() {
                // Move the value into the last sender instead of cloning.
                sender.0.send(value).ok();
                return;
            }
            sender.0.send(value.clone()).ok();
        }
    }
}

impl<T: Clone> Default for BroadcastChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Message response that can be shared between multiple requests.
pub struct BroadcastResponse<T: Clone>(PhantomData<T>);

impl<T: Clone> fmt::Debug for BroadcastResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("BroadcastResponse")
    }
}

impl<T: Clone + Send + 'static> MessageResponse for BroadcastResponse<T> {
    type Sender = BroadcastSender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (BroadcastSender(tx), Request(rx))
    }
}

/// Declares a message as part of an [`Interface`].
///
/// Messages have an associated `Response` that determines the return value of sending the
/// message to a service via [`Addr::send`].
pub trait FromMessage<M>: Interface {
    /// The response behavior when this message is sent to the service.
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// The address of a [service](Service).
///
/// The address of a service allows you to [send](Self::send) messages to the service as long as
/// the service is running. It can be freely cloned.
pub struct Addr<I: Interface> {
    tx: mpsc::UnboundedSender<I>,
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("open", &!self.tx.is_closed())
            .finish()
    }
}

// Manually derive `Clone` to avoid a bound on `I: Clone`.
impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service and returns the response.
    ///
    /// Depending on the message's response behavior, this either returns a future resolving to
    /// the response value, or no future for fire-and-forget messages. Sending the message does
    /// not require to await.
    pub fn send<M>(&self, message: M) -> <I::Response as MessageResponse>::Output
    where
        I: FromMessage<M>,
    {
        let (sender, output) = I::Response::channel();
        self.tx.send(I::from_message(message, sender)).ok();
        output
    }

    /// Creates an address with a detached channel for testing services.
    ///
    /// Messages sent to the address can be inspected on the returned receiver. No service will
    /// respond to messages, so requests will resolve with [`SendError`] when awaited.
    pub fn custom() -> (Self, mpsc::UnboundedReceiver<I>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Creates an address that drops all messages.
    pub fn dummy() -> Self {
        Self::custom().0
    }
}

/// Inbound channel for messages sent through an [`Addr`].
///
/// This channel is meant to be polled in a [`Service`] message loop.
#[derive(Debug)]
pub struct Receiver<I: Interface> {
    rx: mpsc::UnboundedReceiver<I>,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next message, or `None` if all addresses were dropped.
    pub async fn recv(&mut self) -> Option<I> {
        self.rx.recv().await
    }
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to some [`Interface`] through an [`Addr`]. To start a
/// service, create an instance of the service type and call [`start`](Self::start).
///
/// # Implementing Services
///
/// The standard implementation of `spawn_handler` spawns a task with a message loop:
///
/// ```
/// use relay_system::{FromMessage, Interface, NoResponse, Receiver, Service};
///
/// struct MyMessage;
///
/// impl Interface for MyMessage {}
///
/// impl FromMessage<MyMessage> for MyMessage {
///     type Response = NoResponse;
///
///     fn from_message(message: MyMessage, _: ()) -> Self {
///         message
///     }
/// }
///
/// struct MyService;
///
/// impl Service for MyService {
///     type Interface = MyMessage;
///
///     fn spawn_handler(self, mut rx: Receiver<Self::Interface>) {
///         tokio::spawn(async move {
///             while let Some(message) = rx.recv().await {
///                 // handle the message
///             }
///         });
///     }
/// }
/// ```
pub trait Service: Sized {
    /// The interface of messages this service implements.
    type Interface: Interface;

    /// Spawns a task to handle service messages.
    fn spawn_handler(self, rx: Receiver<Self::Interface>);

    /// Starts the service in the current runtime and returns its address.
    fn start(self) -> Addr<Self::Interface> {
        let (addr, rx) = channel();
        self.spawn_handler(rx);
        addr
    }
}

fn channel<I: Interface>() -> (Addr<I>, Receiver<I>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Addr { tx }, Receiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(String, Sender<String>);

    impl Interface for Echo {}

    impl FromMessage<String> for Echo {
        type Response = AsyncResponse<String>;

        fn from_message(message: String, sender: Sender<String>) -> Self {
            Echo(message, sender)
        }
    }

    struct EchoService;

    impl Service for EchoService {
        type Interface = Echo;

        fn spawn_handler(self, mut rx: Receiver<Self::Interface>) {
            tokio::spawn(async move {
                while let Some(Echo(message, sender)) = rx.recv().await {
                    sender.send(message);
                }
            });
        }
    }

    #[tokio::test]
    async fn test_async_response() {
        let addr = EchoService.start();
        let response = addr.send("hello".to_owned()).await;
        assert_eq!(response.as_deref(), Ok("hello"));
    }

    #[tokio::test]
    async fn test_send_error_when_service_stopped() {
        let (addr, rx) = Addr::<Echo>::custom();
        drop(rx);
        let response = addr.send("hello".to_owned()).await;
        assert_eq!(response, Err(SendError));
    }

    #[tokio::test]
    async fn test_broadcast_channel() {
        let mut channel = BroadcastChannel::new();
        let mut requests = Vec::new();

        for _ in 0..3 {
            let (sender, request) = BroadcastResponse::<u32>::channel();
            channel.attach(sender);
            requests.push(request);
        }

        assert_eq!(channel.len(), 3);
        channel.send(42);

        for request in requests {
            assert_eq!(request.await, Ok(42));
        }
    }

    #[tokio::test]
    async fn test_custom_addr_captures_messages() {
        let (addr, mut rx) = Addr::<Echo>::custom();
        let _request = addr.send("captured".to_owned());

        let Echo(message, _) = rx.recv().await.unwrap();
        assert_eq!(message, "captured");
    }
}
