//! Bus operation executors.
//!
//! Every executor follows the same steps: clear the caller's last error,
//! validate, resolve the branch, honour the control block's LAM (before the
//! bus lock is taken), run the backend primitive under the bus lock, turn a
//! missing Q into [`CamacError::NoQ`], record the failure category and store
//! the last error.

use super::CamacDriver;
use crate::address::{Bcna, ChannelAddress, FunctionCode, Word};
use crate::backend::{ControlBlock, HardwareBackend, ScanRange};
use crate::error::{CamacError, Result};
use crate::status;
use tracing::trace;

/// One entry of a general multi-action list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action<W> {
    /// Function code
    pub function: u32,
    /// Channel address
    pub address: ChannelAddress,
    /// Data written, or read back
    pub data: W,
    /// Q response of the cycle
    pub q: bool,
}

impl<W: Word> Action<W> {
    /// Entry with default data.
    pub fn new(function: u32, address: ChannelAddress) -> Self {
        Self {
            function,
            address,
            data: W::default(),
            q: false,
        }
    }

    /// Entry carrying `data`.
    pub fn with_data(function: u32, address: ChannelAddress, data: W) -> Self {
        Self {
            function,
            address,
            data,
            q: false,
        }
    }
}

fn to_bus<W: Word>(data: &[W]) -> Vec<u32> {
    data.iter().map(|w| w.to_bus()).collect()
}

fn from_bus<W: Word>(raw: &[u32], data: &mut [W], count: usize) {
    for (word, value) in data.iter_mut().zip(raw).take(count) {
        *word = W::from_bus(*value);
    }
}

impl<B: HardwareBackend> CamacDriver<B> {
    /// Count a failure against its branch, crate or slot.
    fn finish<T>(&self, bcna: Bcna, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.record_error(bcna, *err);
        }
        status::track(result)
    }

    fn wait_control_block(&self, cb: &ControlBlock) -> Result<()> {
        match &cb.lam {
            Some(lam) => self.wait_for(lam, cb.timeout_ms),
            None => Ok(()),
        }
    }

    /// Execute one function at one address (cfsa / cssa).
    ///
    /// For read functions `data` receives the value; for writes it is sent.
    pub fn single_action<W: Word>(&self, function: u32, address: ChannelAddress, data: &mut W) -> Result<()> {
        status::clear();
        let f = status::track(self.inner.codec.validate_function(function))?;
        let (bcna, branch) = status::track(self.resolve(address))?;

        let mut raw = data.to_bus();
        let result = {
            let _bus = branch.bus.lock();
            self.inner
                .backend
                .single_action(&branch.handle, f, address, W::SIZE, &mut raw)
        };
        trace!(%bcna, function = %f, ?result, "single action");

        let result = match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(CamacError::NoQ),
            Err(err) => Err(err),
        };
        if f.is_read() && result.is_ok() {
            *data = W::from_bus(raw);
        }
        self.finish(bcna, result)
    }

    /// Execute a list of actions on one branch (cfga / csga).
    ///
    /// Runs `cb.repeat_count` entries in order and stops at the first
    /// failure. `cb.tally` reports how many entries were processed. The Q of
    /// the last entry decides success.
    pub fn general_multi_action<W: Word>(&self, actions: &mut [Action<W>], cb: &mut ControlBlock) -> Result<()> {
        status::clear();
        cb.tally = 0;
        let count = cb.repeat_count;
        if count == 0 || count > actions.len() {
            return status::track(Err(CamacError::BadRepeatCount(count)));
        }

        let first = status::track(self.resolve(actions[0].address));
        let (first_bcna, branch) = first?;
        status::track(self.wait_control_block(cb))?;

        let backend = &self.inner.backend;
        let mut failed_at = first_bcna;
        let result = {
            let _bus = branch.bus.lock();
            let mut result = Ok(());
            for (i, action) in actions.iter_mut().take(count).enumerate() {
                cb.tally = i;
                let f = match self.inner.codec.validate_function(action.function) {
                    Ok(f) => f,
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                };
                let decoded = backend.decode(action.address);
                let bcna = match self.inner.codec.validate_address(action.address, decoded) {
                    Ok(bcna) => bcna,
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                };
                if bcna.branch != first_bcna.branch {
                    result = Err(CamacError::MultiBranchNotSupported);
                    break;
                }
                failed_at = bcna;

                let mut raw = action.data.to_bus();
                match backend.single_action(&branch.handle, f, action.address, W::SIZE, &mut raw) {
                    Ok(q) => {
                        action.q = q;
                        if f.is_read() {
                            action.data = W::from_bus(raw);
                        }
                        cb.tally = i + 1;
                    }
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
            }
            result
        };

        let result = result.and_then(|()| match actions.get(count - 1) {
            Some(last) if !last.q => Err(CamacError::NoQ),
            _ => Ok(()),
        });
        self.finish(failed_at, result)
    }

    /// Apply one function across an address range (cfmad / csmad).
    pub fn address_scan<W: Word>(
        &self,
        function: u32,
        start: ChannelAddress,
        end: ChannelAddress,
        data: &mut [W],
        cb: &mut ControlBlock,
    ) -> Result<()> {
        status::clear();
        cb.tally = 0;
        let f = status::track(self.inner.codec.validate_function(function))?;
        let (bcna, branch) = status::track(self.resolve(start))?;
        let end_decoded = self.inner.backend.decode(end);
        status::track(self.inner.codec.validate_address(end, end_decoded))?;
        let range = ScanRange { start, end };
        status::track(self.inner.backend.check_scan_range(range))?;
        if cb.repeat_count > data.len() {
            return status::track(Err(CamacError::BadRepeatCount(cb.repeat_count)));
        }
        status::track(self.wait_control_block(cb))?;

        let mut raw = to_bus(&data[..cb.repeat_count]);
        let result = {
            let _bus = branch.bus.lock();
            self.inner
                .backend
                .address_scan(&branch.handle, f, range, W::SIZE, &mut raw, cb)
        };
        if f.is_read() {
            from_bus(&raw, data, cb.tally);
        }
        self.finish(bcna, result)
    }

    /// Repeat one function until the module stops giving Q (cfubc / csubc).
    pub fn repeat_until_no_q<W: Word>(
        &self,
        function: u32,
        address: ChannelAddress,
        data: &mut [W],
        cb: &mut ControlBlock,
    ) -> Result<()> {
        self.block_transfer(function, address, data, cb, |backend, handle, f, raw, cb| {
            backend.repeat_until_no_q(handle, f, address, W::SIZE, raw, cb)
        })
    }

    /// Repeat each transfer until the module gives Q (cfubr / csubr).
    pub fn repeat_until_q<W: Word>(
        &self,
        function: u32,
        address: ChannelAddress,
        data: &mut [W],
        cb: &mut ControlBlock,
    ) -> Result<()> {
        let retries = self.inner.config.max_noq_retry;
        self.block_transfer(function, address, data, cb, |backend, handle, f, raw, cb| {
            backend.repeat_until_q(handle, f, address, W::SIZE, raw, cb, retries)
        })
    }

    fn block_transfer<W: Word>(
        &self,
        function: u32,
        address: ChannelAddress,
        data: &mut [W],
        cb: &mut ControlBlock,
        run: impl FnOnce(&B, &B::Handle, FunctionCode, &mut [u32], &mut ControlBlock) -> Result<()>,
    ) -> Result<()> {
        status::clear();
        cb.tally = 0;
        let f = status::track(self.inner.codec.validate_function(function))?;
        let (bcna, branch) = status::track(self.resolve(address))?;
        if cb.repeat_count > data.len() {
            return status::track(Err(CamacError::BadRepeatCount(cb.repeat_count)));
        }
        status::track(self.wait_control_block(cb))?;

        let mut raw = to_bus(&data[..cb.repeat_count]);
        let result = {
            let _bus = branch.bus.lock();
            run(&self.inner.backend, &branch.handle, f, &mut raw, cb)
        };
        if f.is_read() {
            from_bus(&raw, data, cb.tally);
        }
        self.finish(bcna, result)
    }
}
