//! Token pool: per-class capacity counters with FIFO wait-lists.
//!
//! Grants are serviced strictly in arrival order per class; a blocked head
//! request blocks smaller requests queued behind it. A request larger than the
//! class total is clamped to the total so it can still run once the class is
//! idle.

use pairofcleats_domain::ResourceClass;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, oneshot};

/// Token amounts per resource class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct TokenRequest {
    /// Compute tokens.
    pub cpu: u32,
    /// I/O tokens.
    pub io: u32,
    /// Memory tokens.
    pub mem: u32,
}

impl TokenRequest {
    /// Request that needs no tokens.
    pub const NONE: Self = Self {
        cpu: 0,
        io: 0,
        mem: 0,
    };

    /// Compute-only request.
    #[must_use]
    pub const fn cpu(cpu: u32) -> Self {
        Self { cpu, io: 0, mem: 0 }
    }

    /// I/O-only request.
    #[must_use]
    pub const fn io(io: u32) -> Self {
        Self { cpu: 0, io, mem: 0 }
    }

    /// Add memory tokens to the request.
    #[must_use]
    pub const fn with_mem(mut self, mem: u32) -> Self {
        self.mem = mem;
        self
    }

    /// Amount requested for `class`.
    #[must_use]
    pub const fn amount(self, class: ResourceClass) -> u32 {
        match class {
            ResourceClass::Cpu => self.cpu,
            ResourceClass::Io => self.io,
            ResourceClass::Memory => self.mem,
        }
    }

    /// Copy of the request with `class` set to `amount`.
    #[must_use]
    pub const fn with_amount(mut self, class: ResourceClass, amount: u32) -> Self {
        match class {
            ResourceClass::Cpu => self.cpu = amount,
            ResourceClass::Io => self.io = amount,
            ResourceClass::Memory => self.mem = amount,
        }
        self
    }

    /// True when no class is requested.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.cpu == 0 && self.io == 0 && self.mem == 0
    }
}

/// Token totals per resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenTotals {
    /// Compute total.
    pub cpu: u32,
    /// I/O total.
    pub io: u32,
    /// Memory total.
    pub mem: u32,
}

impl Default for TokenTotals {
    fn default() -> Self {
        Self {
            cpu: 1,
            io: 1,
            mem: 1,
        }
    }
}

impl TokenTotals {
    /// Total for `class`.
    #[must_use]
    pub const fn get(self, class: ResourceClass) -> u32 {
        match class {
            ResourceClass::Cpu => self.cpu,
            ResourceClass::Io => self.io,
            ResourceClass::Memory => self.mem,
        }
    }
}

/// Partial limit update; `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenLimitUpdate {
    /// New compute total.
    pub cpu_tokens: Option<f64>,
    /// New I/O total.
    pub io_tokens: Option<f64>,
    /// New memory total.
    pub memory_tokens: Option<f64>,
}

/// Apply a limit update: provided values are floored and clamped to at least 1,
/// non-finite values are ignored.
#[must_use]
pub fn apply_scheduler_token_limits(current: TokenTotals, update: &TokenLimitUpdate) -> TokenTotals {
    TokenTotals {
        cpu: update.cpu_tokens.and_then(normalize_limit).unwrap_or(current.cpu),
        io: update.io_tokens.and_then(normalize_limit).unwrap_or(current.io),
        mem: update
            .memory_tokens
            .and_then(normalize_limit)
            .unwrap_or(current.mem),
    }
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "value is finite and clamped into the u32 range before the cast"
)]
fn normalize_limit(value: f64) -> Option<u32> {
    if !value.is_finite() {
        return None;
    }
    Some(value.floor().clamp(1.0, f64::from(u32::MAX)) as u32)
}

/// Per-class view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClassSnapshot {
    /// Configured total.
    pub total: u32,
    /// Tokens currently granted.
    pub in_use: u32,
    /// Blocked acquirers.
    pub waiting: usize,
}

/// Point-in-time view of every class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenPoolSnapshot {
    /// Compute class.
    pub cpu: TokenClassSnapshot,
    /// I/O class.
    pub io: TokenClassSnapshot,
    /// Memory class.
    pub mem: TokenClassSnapshot,
}

impl TokenPoolSnapshot {
    /// Snapshot for `class`.
    #[must_use]
    pub const fn get(&self, class: ResourceClass) -> TokenClassSnapshot {
        match class {
            ResourceClass::Cpu => self.cpu,
            ResourceClass::Io => self.io,
            ResourceClass::Memory => self.mem,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    amount: u32,
    grant: oneshot::Sender<u32>,
}

#[derive(Debug)]
struct ClassState {
    total: u32,
    in_use: u32,
    waiters: VecDeque<Waiter>,
}

impl ClassState {
    const fn new(total: u32) -> Self {
        Self {
            total,
            in_use: 0,
            waiters: VecDeque::new(),
        }
    }

    fn effective(&self, amount: u32) -> u32 {
        amount.min(self.total)
    }

    fn fits(&self, amount: u32) -> bool {
        self.in_use.saturating_add(self.effective(amount)) <= self.total
    }

    /// Grant queued waiters in order until the head no longer fits.
    fn service(&mut self) {
        while let Some(head) = self.waiters.front() {
            if head.grant.is_closed() {
                self.waiters.pop_front();
                continue;
            }
            if !self.fits(head.amount) {
                break;
            }
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let granted = self.effective(waiter.amount);
            self.in_use += granted;
            if waiter.grant.send(granted).is_err() {
                self.in_use -= granted;
            }
        }
    }

    fn release(&mut self, amount: u32) {
        self.in_use = self.in_use.saturating_sub(amount);
    }

    fn snapshot(&self) -> TokenClassSnapshot {
        TokenClassSnapshot {
            total: self.total,
            in_use: self.in_use,
            waiting: self.waiters.iter().filter(|w| !w.grant.is_closed()).count(),
        }
    }
}

#[derive(Debug)]
struct PoolState {
    cpu: ClassState,
    io: ClassState,
    mem: ClassState,
}

impl PoolState {
    const fn class(&self, class: ResourceClass) -> &ClassState {
        match class {
            ResourceClass::Cpu => &self.cpu,
            ResourceClass::Io => &self.io,
            ResourceClass::Memory => &self.mem,
        }
    }

    const fn class_mut(&mut self, class: ResourceClass) -> &mut ClassState {
        match class {
            ResourceClass::Cpu => &mut self.cpu,
            ResourceClass::Io => &mut self.io,
            ResourceClass::Memory => &mut self.mem,
        }
    }

    fn service_all(&mut self) {
        for class in ResourceClass::ALL {
            self.class_mut(class).service();
        }
    }

    fn can_reserve(&mut self, request: TokenRequest) -> bool {
        ResourceClass::ALL.into_iter().all(|class| {
            let amount = request.amount(class);
            if amount == 0 {
                return true;
            }
            let slot = self.class_mut(class);
            slot.service();
            slot.waiters.is_empty() && slot.fits(amount)
        })
    }
}

#[derive(Debug)]
struct PoolInner {
    state: Mutex<PoolState>,
    capacity_changed: Notify,
}

/// Clonable handle to a shared token pool.
#[derive(Debug, Clone)]
pub struct TokenPool {
    inner: Arc<PoolInner>,
}

impl Default for TokenPool {
    fn default() -> Self {
        Self::new(TokenTotals::default())
    }
}

impl TokenPool {
    /// Create a pool with the given totals (each clamped to at least 1).
    #[must_use]
    pub fn new(totals: TokenTotals) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    cpu: ClassState::new(totals.cpu.max(1)),
                    io: ClassState::new(totals.io.max(1)),
                    mem: ClassState::new(totals.mem.max(1)),
                }),
                capacity_changed: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until `amount` tokens of `class` are available, then hold them.
    pub async fn acquire(&self, class: ResourceClass, amount: u32) -> TokenGrant {
        loop {
            let receiver = {
                let mut state = self.lock();
                let slot = state.class_mut(class);
                slot.service();
                if slot.waiters.is_empty() && slot.fits(amount) {
                    let granted = slot.effective(amount);
                    slot.in_use += granted;
                    return TokenGrant::new(self.clone(), TokenRequest::NONE.with_amount(class, granted));
                }
                let (grant, receiver) = oneshot::channel();
                slot.waiters.push_back(Waiter { amount, grant });
                receiver
            };

            let mut pending = PendingAcquire {
                pool: self,
                class,
                receiver: Some(receiver),
            };
            if let Some(granted) = pending.wait().await {
                return TokenGrant::new(self.clone(), TokenRequest::NONE.with_amount(class, granted));
            }
        }
    }

    /// Reserve every class in `request` at once, or nothing.
    ///
    /// Fails when any needed class lacks capacity or already has blocked
    /// acquirers, so direct acquirers keep their FIFO position.
    #[must_use]
    pub fn try_reserve(&self, request: TokenRequest) -> Option<TokenGrant> {
        let mut state = self.lock();
        if !state.can_reserve(request) {
            return None;
        }
        let mut held = TokenRequest::NONE;
        for class in ResourceClass::ALL {
            let slot = state.class_mut(class);
            let granted = slot.effective(request.amount(class));
            slot.in_use += granted;
            held = held.with_amount(class, granted);
        }
        drop(state);
        Some(TokenGrant::new(self.clone(), held))
    }

    /// True when [`Self::try_reserve`] would currently succeed.
    #[must_use]
    pub fn can_reserve(&self, request: TokenRequest) -> bool {
        self.lock().can_reserve(request)
    }

    /// Apply a partial limit update and return the new totals.
    ///
    /// Shrinking never revokes granted tokens; it only delays new grants
    /// until usage drains below the new total.
    pub fn set_limits(&self, update: &TokenLimitUpdate) -> TokenTotals {
        let totals = {
            let mut state = self.lock();
            let next = apply_scheduler_token_limits(totals_of(&state), update);
            for class in ResourceClass::ALL {
                state.class_mut(class).total = next.get(class);
            }
            state.service_all();
            next
        };
        tracing::debug!(
            cpu = totals.cpu,
            io = totals.io,
            mem = totals.mem,
            "token limits updated"
        );
        self.inner.capacity_changed.notify_waiters();
        totals
    }

    /// Current totals.
    #[must_use]
    pub fn totals(&self) -> TokenTotals {
        totals_of(&self.lock())
    }

    /// Current totals, usage and waiters per class.
    #[must_use]
    pub fn snapshot(&self) -> TokenPoolSnapshot {
        let state = self.lock();
        TokenPoolSnapshot {
            cpu: state.cpu.snapshot(),
            io: state.io.snapshot(),
            mem: state.mem.snapshot(),
        }
    }

    pub(crate) fn capacity_changed(&self) -> &Notify {
        &self.inner.capacity_changed
    }

    fn release(&self, held: TokenRequest) {
        if held.is_empty() {
            return;
        }
        {
            let mut state = self.lock();
            for class in ResourceClass::ALL {
                let slot = state.class_mut(class);
                slot.release(held.amount(class));
                slot.service();
            }
        }
        self.inner.capacity_changed.notify_waiters();
    }
}

fn totals_of(state: &PoolState) -> TokenTotals {
    TokenTotals {
        cpu: state.class(ResourceClass::Cpu).total,
        io: state.class(ResourceClass::Io).total,
        mem: state.class(ResourceClass::Memory).total,
    }
}

/// In-flight acquire; returns a grant that was sent but never received.
struct PendingAcquire<'a> {
    pool: &'a TokenPool,
    class: ResourceClass,
    receiver: Option<oneshot::Receiver<u32>>,
}

impl PendingAcquire<'_> {
    async fn wait(&mut self) -> Option<u32> {
        let receiver = self.receiver.as_mut()?;
        let granted = receiver.await.ok();
        self.receiver = None;
        granted
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if let Ok(granted) = receiver.try_recv() {
                self.pool
                    .release(TokenRequest::NONE.with_amount(self.class, granted));
            }
        }
    }
}

/// Tokens held until this grant is released or dropped.
#[derive(Debug)]
#[must_use = "tokens are released as soon as the grant is dropped"]
pub struct TokenGrant {
    pool: TokenPool,
    held: TokenRequest,
}

impl TokenGrant {
    const fn new(pool: TokenPool, held: TokenRequest) -> Self {
        Self { pool, held }
    }

    /// Tokens held by this grant (after clamping to class totals).
    #[must_use]
    pub const fn held(&self) -> TokenRequest {
        self.held
    }

    /// Return the tokens to the pool and wake queued acquirers.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for TokenGrant {
    fn drop(&mut self) {
        let held = std::mem::take(&mut self.held);
        self.pool.release(held);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn totals(cpu: u32, io: u32, mem: u32) -> TokenTotals {
        TokenTotals { cpu, io, mem }
    }

    #[test]
    fn limit_update_floors_clamps_and_skips_missing() {
        let update = TokenLimitUpdate {
            cpu_tokens: Some(8.9),
            io_tokens: Some(0.0),
            memory_tokens: None,
        };
        assert_eq!(
            apply_scheduler_token_limits(totals(2, 3, 4), &update),
            totals(8, 1, 4)
        );
    }

    #[test]
    fn limit_update_ignores_non_finite_values() {
        let update = TokenLimitUpdate {
            cpu_tokens: Some(f64::NAN),
            io_tokens: Some(f64::INFINITY),
            memory_tokens: Some(-3.0),
        };
        assert_eq!(
            apply_scheduler_token_limits(totals(2, 3, 4), &update),
            totals(2, 3, 1)
        );
    }

    #[tokio::test]
    async fn acquire_and_release_track_usage() {
        let pool = TokenPool::new(totals(2, 1, 1));
        let first = pool.acquire(ResourceClass::Cpu, 1).await;
        let second = pool.acquire(ResourceClass::Cpu, 1).await;
        assert_eq!(pool.snapshot().cpu.in_use, 2);

        first.release();
        assert_eq!(pool.snapshot().cpu.in_use, 1);
        drop(second);
        assert_eq!(pool.snapshot().cpu.in_use, 0);
    }

    #[tokio::test]
    async fn blocked_acquirer_is_woken_on_release() {
        let pool = TokenPool::new(totals(1, 1, 1));
        let held = pool.acquire(ResourceClass::Io, 1).await;

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire(ResourceClass::Io, 1).await.held() }
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pool.snapshot().io.waiting, 1);

        drop(held);
        let granted = waiter.await;
        assert_eq!(granted.ok().map(|held| held.io), Some(1));
    }

    #[tokio::test]
    async fn head_of_line_blocks_smaller_requests() {
        let pool = TokenPool::new(totals(2, 1, 1));
        let held = pool.acquire(ResourceClass::Cpu, 1).await;

        let big = tokio::spawn({
            let pool = pool.clone();
            async move {
                let _grant = pool.acquire(ResourceClass::Cpu, 2).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(pool.try_reserve(TokenRequest::cpu(1)).is_none());
        drop(held);
        assert!(big.await.is_ok());
        assert_eq!(pool.snapshot().cpu.in_use, 0);
    }

    #[tokio::test]
    async fn shrink_blocks_new_grants_until_usage_drains() {
        let pool = TokenPool::new(totals(3, 1, 1));
        let running = pool.acquire(ResourceClass::Cpu, 3).await;

        let totals_after = pool.set_limits(&TokenLimitUpdate {
            cpu_tokens: Some(1.0),
            ..TokenLimitUpdate::default()
        });
        assert_eq!(totals_after.cpu, 1);
        assert_eq!(pool.snapshot().cpu.in_use, 3);
        assert!(pool.try_reserve(TokenRequest::cpu(1)).is_none());

        drop(running);
        let grant = pool.try_reserve(TokenRequest::cpu(1));
        assert!(grant.is_some());
    }

    #[tokio::test]
    async fn oversized_request_is_clamped_to_total() {
        let pool = TokenPool::new(totals(2, 1, 1));
        let grant = pool.acquire(ResourceClass::Cpu, 5).await;
        assert_eq!(grant.held().cpu, 2);
        assert_eq!(pool.snapshot().cpu.in_use, 2);
    }

    #[tokio::test]
    async fn cancelled_acquire_does_not_leak_tokens() {
        let pool = TokenPool::new(totals(1, 1, 1));
        let held = pool.acquire(ResourceClass::Memory, 1).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(5),
            pool.acquire(ResourceClass::Memory, 1),
        )
        .await;
        assert!(cancelled.is_err());

        drop(held);
        assert_eq!(pool.snapshot().mem.in_use, 0);
        assert_eq!(pool.snapshot().mem.waiting, 0);
        assert!(pool.try_reserve(TokenRequest::NONE.with_mem(1)).is_some());
    }

    #[test]
    fn try_reserve_is_all_or_nothing() {
        let pool = TokenPool::new(totals(1, 1, 1));
        let io = pool.try_reserve(TokenRequest::io(1));
        assert!(io.is_some());

        let both = pool.try_reserve(TokenRequest { cpu: 1, io: 1, mem: 0 });
        assert!(both.is_none());
        assert_eq!(pool.snapshot().cpu.in_use, 0);
    }

    fn request_strategy() -> impl Strategy<Value = TokenRequest> {
        (0u32..4, 0u32..4, 0u32..4).prop_map(|(cpu, io, mem)| TokenRequest { cpu, io, mem })
    }

    proptest! {
        #[test]
        fn reservations_never_exceed_totals_and_fully_release(
            requests in proptest::collection::vec(request_strategy(), 1..32),
            drop_mask in proptest::collection::vec(any::<bool>(), 32),
        ) {
            let pool = TokenPool::new(totals(4, 3, 2));
            let mut held = Vec::new();
            for (index, request) in requests.into_iter().enumerate() {
                if let Some(grant) = pool.try_reserve(request) {
                    held.push(grant);
                }
                if drop_mask.get(index).copied().unwrap_or(false) && !held.is_empty() {
                    drop(held.remove(0));
                }
                let snapshot = pool.snapshot();
                for class in ResourceClass::ALL {
                    let view = snapshot.get(class);
                    prop_assert!(view.in_use <= view.total);
                }
            }
            held.clear();
            let snapshot = pool.snapshot();
            for class in ResourceClass::ALL {
                prop_assert_eq!(snapshot.get(class).in_use, 0);
            }
        }
    }
}
