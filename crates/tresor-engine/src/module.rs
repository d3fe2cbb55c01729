//! Module interface
//!
//! A module is an independently scheduled unit of asynchronous work. It
//! accepts requests from other modules, advances them in small non-blocking
//! steps and hands two kinds of requests back to the composition:
//!
//! - generated requests: work it wants another module to do
//! - completed requests: work it finished on behalf of a caller
//!
//! Both queues are exposed through a peek/drop pair so the composition can
//! look at the front entry before taking it.

use std::any::Any;
use std::fmt;

/// Correlation token of a request within one module
pub type ModuleRequestId = u64;

/// Closed set of module roles in a Tresor instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ModuleId {
    Crypto = 0,
    ClientData,
    TrustAnchor,
    CommandPool,
    BlockIo,
    Cache,
    MetaTree,
    FreeTree,
    VirtualBlockDevice,
    SuperblockControl,
    BlockAllocator,
    VbdInitializer,
    FtInitializer,
    SbInitializer,
    RequestPool,
    SbCheck,
    VbdCheck,
    FtCheck,
    FtResizing,
}

impl ModuleId {
    /// Number of module roles
    pub const COUNT: usize = 19;

    /// All roles in scheduling order
    pub const ALL: [Self; Self::COUNT] = [
        Self::Crypto,
        Self::ClientData,
        Self::TrustAnchor,
        Self::CommandPool,
        Self::BlockIo,
        Self::Cache,
        Self::MetaTree,
        Self::FreeTree,
        Self::VirtualBlockDevice,
        Self::SuperblockControl,
        Self::BlockAllocator,
        Self::VbdInitializer,
        Self::FtInitializer,
        Self::SbInitializer,
        Self::RequestPool,
        Self::SbCheck,
        Self::VbdCheck,
        Self::FtCheck,
        Self::FtResizing,
    ];

    /// Registry slot of this role
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Crypto => "crypto",
            Self::ClientData => "client_data",
            Self::TrustAnchor => "trust_anchor",
            Self::CommandPool => "command_pool",
            Self::BlockIo => "block_io",
            Self::Cache => "cache",
            Self::MetaTree => "meta_tree",
            Self::FreeTree => "free_tree",
            Self::VirtualBlockDevice => "vbd",
            Self::SuperblockControl => "sb_control",
            Self::BlockAllocator => "block_allocator",
            Self::VbdInitializer => "vbd_initializer",
            Self::FtInitializer => "ft_initializer",
            Self::SbInitializer => "sb_initializer",
            Self::RequestPool => "request_pool",
            Self::SbCheck => "sb_check",
            Self::VbdCheck => "vbd_check",
            Self::FtCheck => "ft_check",
            Self::FtResizing => "ft_resizing",
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing information carried by every request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    src_module_id: ModuleId,
    src_request_id: ModuleRequestId,
    dst_module_id: ModuleId,
    dst_request_id: Option<ModuleRequestId>,
}

impl RequestHeader {
    #[must_use]
    pub const fn new(
        src_module_id: ModuleId,
        src_request_id: ModuleRequestId,
        dst_module_id: ModuleId,
    ) -> Self {
        Self {
            src_module_id,
            src_request_id,
            dst_module_id,
            dst_request_id: None,
        }
    }

    #[must_use]
    pub const fn src_module_id(&self) -> ModuleId {
        self.src_module_id
    }

    #[must_use]
    pub const fn src_request_id(&self) -> ModuleRequestId {
        self.src_request_id
    }

    #[must_use]
    pub const fn dst_module_id(&self) -> ModuleId {
        self.dst_module_id
    }

    /// Id assigned by the destination, `None` until it accepted the request
    #[must_use]
    pub const fn dst_request_id(&self) -> Option<ModuleRequestId> {
        self.dst_request_id
    }

    /// Record the id under which the destination accepted the request
    ///
    /// # Panics
    ///
    /// Panics if the request was already accepted once.
    pub fn set_dst_request_id(&mut self, id: ModuleRequestId) {
        assert!(
            self.dst_request_id.is_none(),
            "request from {} accepted twice by {}",
            self.src_module_id,
            self.dst_module_id
        );
        self.dst_request_id = Some(id);
    }
}

impl fmt::Display for RequestHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}",
            self.src_module_id, self.src_request_id, self.dst_module_id
        )?;
        if let Some(id) = self.dst_request_id {
            write!(f, ":{id}")?;
        }
        Ok(())
    }
}

/// Unit of cross-module work
pub trait ModuleRequest: Any + fmt::Debug {
    fn header(&self) -> &RequestHeader;

    fn header_mut(&mut self) -> &mut RequestHeader;
}

impl dyn ModuleRequest {
    /// Borrow the request as its concrete type
    #[must_use]
    pub fn downcast_ref<T: ModuleRequest>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }

    /// Take the request back as its concrete type
    pub fn downcast<T: ModuleRequest>(self: Box<Self>) -> Result<Box<T>, Box<Self>> {
        if !(&*self as &dyn Any).is::<T>() {
            return Err(self);
        }
        let any: Box<dyn Any> = self;
        Ok(any
            .downcast::<T>()
            .unwrap_or_else(|_| unreachable!("type checked above")))
    }
}

/// Independently scheduled unit of asynchronous work
///
/// The default implementations describe a module that neither accepts nor
/// produces requests. Calling a queue operation the module does not support
/// is a wiring bug and panics.
pub trait Module {
    /// Whether `submit_request` may be called right now
    fn ready_to_submit_request(&self) -> bool {
        false
    }

    /// Hand a request over to this module
    ///
    /// # Panics
    ///
    /// Panics if the module is not ready to accept a request.
    fn submit_request(&mut self, req: Box<dyn ModuleRequest>) {
        panic!("module does not accept requests: {}", req.header());
    }

    /// Do one quantum of work, setting `progress` if any state advanced
    fn execute(&mut self, _progress: &mut bool) {}

    /// Front of the generated-request queue
    fn peek_generated_request(&self) -> Option<&dyn ModuleRequest> {
        None
    }

    /// Remove the front of the generated-request queue
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty.
    fn drop_generated_request(&mut self) -> Box<dyn ModuleRequest> {
        panic!("module has no generated requests");
    }

    /// A request this module generated has been completed by its destination
    ///
    /// # Panics
    ///
    /// Panics if the module never generates requests.
    fn generated_request_complete(&mut self, req: Box<dyn ModuleRequest>) {
        panic!("unexpected completion: {}", req.header());
    }

    /// Front of the completed-request queue
    fn peek_completed_request(&self) -> Option<&dyn ModuleRequest> {
        None
    }

    /// Remove the front of the completed-request queue
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty.
    fn drop_completed_request(&mut self) -> Box<dyn ModuleRequest> {
        panic!("module has no completed requests");
    }
}
