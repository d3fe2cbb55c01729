//! Module composition
//!
//! Owns one slot per [`ModuleId`] and schedules the registered modules
//! cooperatively. A pass executes every module in id order and then moves
//! its requests: generated requests go to their destination if it is ready,
//! completed requests go back to their source unconditionally.
//!
//! There is no queue inside the composition. A request whose destination is
//! busy stays at the front of its source's queue and is offered again on
//! the next pass.

use crate::error::{EngineError, EngineResult};
use crate::module::{Module, ModuleId};
use tracing::{debug, trace};

pub struct ModuleComposition {
    modules: [Option<Box<dyn Module>>; ModuleId::COUNT],
}

impl Default for ModuleComposition {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleComposition {
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: std::array::from_fn(|_| None),
        }
    }

    /// Register a module under `id`
    pub fn add_module(&mut self, id: ModuleId, module: Box<dyn Module>) -> EngineResult<()> {
        let slot = &mut self.modules[id.index()];
        if slot.is_some() {
            return Err(EngineError::DuplicateModule(id));
        }
        *slot = Some(module);
        debug!("registered module {id}");
        Ok(())
    }

    /// Unregister the module under `id` and hand it back
    pub fn remove_module(&mut self, id: ModuleId) -> EngineResult<Box<dyn Module>> {
        let module = self.modules[id.index()]
            .take()
            .ok_or(EngineError::UnknownModule(id))?;
        debug!("removed module {id}");
        Ok(module)
    }

    #[must_use]
    pub fn contains(&self, id: ModuleId) -> bool {
        self.modules[id.index()].is_some()
    }

    /// Run one scheduler pass
    ///
    /// Returns whether any module made progress. A request addressed to an
    /// unregistered module is a wiring error; it is left in its queue and
    /// the pass is aborted.
    pub fn execute_modules(&mut self) -> EngineResult<bool> {
        let mut progress = false;
        for id in ModuleId::ALL {
            // the module is taken out of its slot so it can be borrowed
            // alongside the module it exchanges requests with
            let Some(mut module) = self.modules[id.index()].take() else {
                continue;
            };
            module.execute(&mut progress);
            let result = self.route(id, module.as_mut(), &mut progress);
            self.modules[id.index()] = Some(module);
            result?;
        }
        Ok(progress)
    }

    /// Run passes until one makes no progress
    ///
    /// Returns false if the modules were still progressing after
    /// `max_passes` passes. Idle does not mean finished: a module waiting
    /// for its store to complete queued I/O reports no progress, so
    /// requests may still be in flight when this returns true.
    pub fn execute_until_idle(&mut self, max_passes: usize) -> EngineResult<bool> {
        for _ in 0..max_passes {
            if !self.execute_modules()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn route(
        &mut self,
        src_id: ModuleId,
        module: &mut dyn Module,
        progress: &mut bool,
    ) -> EngineResult<()> {
        while let Some(req) = module.peek_generated_request() {
            let dst_id = req.header().dst_module_id();
            let ready = if dst_id == src_id {
                module.ready_to_submit_request()
            } else {
                self.slot(dst_id)?.ready_to_submit_request()
            };
            if !ready {
                break;
            }

            let req = module.drop_generated_request();
            trace!("submit {}", req.header());
            if dst_id == src_id {
                module.submit_request(req);
            } else {
                self.slot_mut(dst_id)?.submit_request(req);
            }
            *progress = true;
        }

        while let Some(req) = module.peek_completed_request() {
            let owner_id = req.header().src_module_id();
            if owner_id != src_id {
                self.slot(owner_id)?;
            }

            let req = module.drop_completed_request();
            trace!("complete {}", req.header());
            if owner_id == src_id {
                module.generated_request_complete(req);
            } else {
                self.slot_mut(owner_id)?.generated_request_complete(req);
            }
            *progress = true;
        }
        Ok(())
    }

    fn slot(&self, id: ModuleId) -> EngineResult<&dyn Module> {
        self.modules[id.index()]
            .as_deref()
            .ok_or(EngineError::UnknownModule(id))
    }

    fn slot_mut(&mut self, id: ModuleId) -> EngineResult<&mut Box<dyn Module>> {
        self.modules[id.index()]
            .as_mut()
            .ok_or(EngineError::UnknownModule(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ModuleRequest, ModuleRequestId, RequestHeader};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug)]
    struct Ping {
        header: RequestHeader,
        value: u32,
    }

    impl Ping {
        fn new(src: ModuleId, id: ModuleRequestId, dst: ModuleId, value: u32) -> Self {
            Self {
                header: RequestHeader::new(src, id, dst),
                value,
            }
        }
    }

    impl ModuleRequest for Ping {
        fn header(&self) -> &RequestHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut RequestHeader {
            &mut self.header
        }
    }

    /// Issues a fixed list of requests and records their completions
    struct Client {
        queue: VecDeque<Box<dyn ModuleRequest>>,
        completed: Rc<RefCell<Vec<u32>>>,
    }

    impl Module for Client {
        fn peek_generated_request(&self) -> Option<&dyn ModuleRequest> {
            self.queue.front().map(|req| req.as_ref())
        }

        fn drop_generated_request(&mut self) -> Box<dyn ModuleRequest> {
            self.queue.pop_front().unwrap()
        }

        fn generated_request_complete(&mut self, req: Box<dyn ModuleRequest>) {
            let ping = req.downcast::<Ping>().unwrap();
            assert!(ping.header().dst_request_id().is_some());
            self.completed.borrow_mut().push(ping.value);
        }
    }

    /// Serves one request at a time and is busy for `busy_passes` passes
    struct Server {
        busy_passes: u32,
        current: Option<(Box<dyn ModuleRequest>, u32)>,
        done: VecDeque<Box<dyn ModuleRequest>>,
        next_id: ModuleRequestId,
        submits: Rc<Cell<u32>>,
        refused_window_violations: Rc<Cell<u32>>,
    }

    impl Server {
        fn new(busy_passes: u32, submits: Rc<Cell<u32>>, violations: Rc<Cell<u32>>) -> Self {
            Self {
                busy_passes,
                current: None,
                done: VecDeque::new(),
                next_id: 0,
                submits,
                refused_window_violations: violations,
            }
        }
    }

    impl Module for Server {
        fn ready_to_submit_request(&self) -> bool {
            self.current.is_none()
        }

        fn submit_request(&mut self, mut req: Box<dyn ModuleRequest>) {
            if self.current.is_some() {
                self.refused_window_violations
                    .set(self.refused_window_violations.get() + 1);
            }
            req.header_mut().set_dst_request_id(self.next_id);
            self.next_id += 1;
            self.submits.set(self.submits.get() + 1);
            self.current = Some((req, self.busy_passes));
        }

        fn execute(&mut self, progress: &mut bool) {
            let Some((_, left)) = self.current.as_mut() else {
                return;
            };
            if *left > 0 {
                *left -= 1;
                *progress = true;
                return;
            }
            if let Some((req, _)) = self.current.take() {
                self.done.push_back(req);
                *progress = true;
            }
        }

        fn peek_completed_request(&self) -> Option<&dyn ModuleRequest> {
            self.done.front().map(|req| req.as_ref())
        }

        fn drop_completed_request(&mut self) -> Box<dyn ModuleRequest> {
            self.done.pop_front().unwrap()
        }
    }

    fn client(values: &[u32], dst: ModuleId) -> (Client, Rc<RefCell<Vec<u32>>>) {
        let completed = Rc::new(RefCell::new(Vec::new()));
        let queue = values
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                Box::new(Ping::new(ModuleId::FreeTree, idx as u64, dst, *value))
                    as Box<dyn ModuleRequest>
            })
            .collect();
        (
            Client {
                queue,
                completed: Rc::clone(&completed),
            },
            completed,
        )
    }

    #[test]
    fn test_requests_delivered_once_in_order() {
        let submits = Rc::new(Cell::new(0));
        let violations = Rc::new(Cell::new(0));
        let (client, completed) = client(&[1, 2, 3], ModuleId::MetaTree);

        let mut composition = ModuleComposition::new();
        composition
            .add_module(ModuleId::FreeTree, Box::new(client))
            .unwrap();
        composition
            .add_module(
                ModuleId::MetaTree,
                Box::new(Server::new(2, Rc::clone(&submits), Rc::clone(&violations))),
            )
            .unwrap();

        assert!(composition.execute_until_idle(100).unwrap());

        assert_eq!(*completed.borrow(), vec![1, 2, 3]);
        assert_eq!(submits.get(), 3);
        assert_eq!(violations.get(), 0);
    }

    #[test]
    fn test_backpressure_holds_requests() {
        let submits = Rc::new(Cell::new(0));
        let violations = Rc::new(Cell::new(0));
        let (client, completed) = client(&[7, 8], ModuleId::MetaTree);

        let mut composition = ModuleComposition::new();
        composition
            .add_module(ModuleId::FreeTree, Box::new(client))
            .unwrap();
        composition
            .add_module(
                ModuleId::MetaTree,
                Box::new(Server::new(5, Rc::clone(&submits), Rc::clone(&violations))),
            )
            .unwrap();

        // the first request is accepted, the second waits while the server is busy
        assert!(composition.execute_modules().unwrap());
        assert_eq!(submits.get(), 1);
        for _ in 0..3 {
            composition.execute_modules().unwrap();
            assert_eq!(submits.get(), 1);
        }
        assert!(completed.borrow().is_empty());

        composition.execute_until_idle(100).unwrap();
        assert_eq!(*completed.borrow(), vec![7, 8]);
        assert_eq!(submits.get(), 2);
        assert_eq!(violations.get(), 0);
    }

    /// Holds its request until the shared gate opens
    struct Gated {
        open: Rc<Cell<bool>>,
        current: Option<Box<dyn ModuleRequest>>,
        done: Option<Box<dyn ModuleRequest>>,
    }

    impl Module for Gated {
        fn ready_to_submit_request(&self) -> bool {
            self.current.is_none() && self.done.is_none()
        }

        fn submit_request(&mut self, mut req: Box<dyn ModuleRequest>) {
            req.header_mut().set_dst_request_id(0);
            self.current = Some(req);
        }

        fn execute(&mut self, progress: &mut bool) {
            if self.open.get() && self.current.is_some() {
                self.done = self.current.take();
                *progress = true;
            }
        }

        fn peek_completed_request(&self) -> Option<&dyn ModuleRequest> {
            self.done.as_deref()
        }

        fn drop_completed_request(&mut self) -> Box<dyn ModuleRequest> {
            self.done.take().unwrap()
        }
    }

    #[test]
    fn test_idle_with_request_in_flight() {
        let open = Rc::new(Cell::new(false));
        let (client, completed) = client(&[4], ModuleId::MetaTree);

        let mut composition = ModuleComposition::new();
        composition
            .add_module(ModuleId::FreeTree, Box::new(client))
            .unwrap();
        composition
            .add_module(
                ModuleId::MetaTree,
                Box::new(Gated {
                    open: Rc::clone(&open),
                    current: None,
                    done: None,
                }),
            )
            .unwrap();

        // the request is accepted, then nothing moves until the gate opens
        assert!(composition.execute_until_idle(100).unwrap());
        assert!(completed.borrow().is_empty());
        assert!(!composition.execute_modules().unwrap());

        open.set(true);
        assert!(composition.execute_until_idle(100).unwrap());
        assert_eq!(*completed.borrow(), vec![4]);
    }

    #[test]
    fn test_unknown_destination() {
        let (client, _) = client(&[1], ModuleId::Crypto);
        let mut composition = ModuleComposition::new();
        composition
            .add_module(ModuleId::FreeTree, Box::new(client))
            .unwrap();

        assert!(matches!(
            composition.execute_modules(),
            Err(EngineError::UnknownModule(ModuleId::Crypto))
        ));
        // the module is back in its slot
        assert!(composition.contains(ModuleId::FreeTree));
    }

    #[test]
    fn test_unknown_source_on_completion() {
        let submits = Rc::new(Cell::new(0));
        let violations = Rc::new(Cell::new(0));
        let mut server = Server::new(0, submits, violations);
        server.done.push_back(Box::new(Ping::new(
            ModuleId::SuperblockControl,
            0,
            ModuleId::MetaTree,
            1,
        )));

        let mut composition = ModuleComposition::new();
        composition
            .add_module(ModuleId::MetaTree, Box::new(server))
            .unwrap();
        assert!(matches!(
            composition.execute_modules(),
            Err(EngineError::UnknownModule(ModuleId::SuperblockControl))
        ));
    }

    #[test]
    fn test_registration() {
        let mut composition = ModuleComposition::new();
        let (first, _) = client(&[], ModuleId::MetaTree);
        let (second, _) = client(&[], ModuleId::MetaTree);

        composition
            .add_module(ModuleId::FreeTree, Box::new(first))
            .unwrap();
        assert!(matches!(
            composition.add_module(ModuleId::FreeTree, Box::new(second)),
            Err(EngineError::DuplicateModule(ModuleId::FreeTree))
        ));

        assert!(composition.remove_module(ModuleId::FreeTree).is_ok());
        assert!(matches!(
            composition.remove_module(ModuleId::FreeTree),
            Err(EngineError::UnknownModule(ModuleId::FreeTree))
        ));

        // an empty composition is idle right away
        assert!(!composition.execute_modules().unwrap());
    }
}
