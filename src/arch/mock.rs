//! Recording CPU for host tests. State is per test thread.

use core::cell::RefCell;
use std::{thread_local, vec::Vec};

use super::{Context, Cpu};
use crate::memory::{PhysFrame, VirtAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuEvent {
    DisableInterrupts,
    EnableInterrupts,
    Halt,
    LoadDirectory(PhysFrame),
    EnablePaging,
    InvalidatePage(VirtAddr),
    PrepareStack { esp: u32 },
    Switch { saved: bool, eip: u32, esp: u32 },
}

struct MockState {
    interrupts: bool,
    events: Vec<CpuEvent>,
}

thread_local! {
    static STATE: RefCell<MockState> = const {
        RefCell::new(MockState {
            interrupts: true,
            events: Vec::new(),
        })
    };
}

pub struct MockCpu;

fn record(event: CpuEvent) {
    STATE.with(|s| s.borrow_mut().events.push(event));
}

/// Clears the log and sets the interrupt flag.
pub fn reset(interrupts: bool) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        s.interrupts = interrupts;
        s.events.clear();
    });
}

pub fn clear_events() {
    STATE.with(|s| s.borrow_mut().events.clear());
}

pub fn events() -> Vec<CpuEvent> {
    STATE.with(|s| s.borrow().events.clone())
}

pub fn switches() -> Vec<CpuEvent> {
    events()
        .into_iter()
        .filter(|e| matches!(e, CpuEvent::Switch { .. }))
        .collect()
}

impl Cpu for MockCpu {
    fn interrupts_enabled() -> bool {
        STATE.with(|s| s.borrow().interrupts)
    }

    fn disable_interrupts() {
        STATE.with(|s| s.borrow_mut().interrupts = false);
        record(CpuEvent::DisableInterrupts);
    }

    fn enable_interrupts() {
        STATE.with(|s| s.borrow_mut().interrupts = true);
        record(CpuEvent::EnableInterrupts);
    }

    fn halt() {
        record(CpuEvent::Halt);
    }

    unsafe fn load_directory(directory: PhysFrame) {
        record(CpuEvent::LoadDirectory(directory));
    }

    unsafe fn enable_paging() {
        record(CpuEvent::EnablePaging);
    }

    fn invalidate_page(addr: VirtAddr) {
        record(CpuEvent::InvalidatePage(addr));
    }

    unsafe fn prepare_stack(context: &Context) {
        record(CpuEvent::PrepareStack { esp: context.esp });
    }

    unsafe fn switch_context(prev: Option<*mut Context>, next: *const Context) {
        let next = *next;
        record(CpuEvent::Switch {
            saved: prev.is_some(),
            eip: next.eip,
            esp: next.esp,
        });
    }
}
