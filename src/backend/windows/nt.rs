//! NTDLL and Kernel32 bindings used by the native Windows backend.

use std::mem;

use winapi::shared::minwindef::{DWORD, FALSE, LPVOID, ULONG};
use winapi::shared::ntdef::{NTSTATUS, PVOID};
use winapi::um::handleapi::CloseHandle;
use winapi::um::memoryapi::VirtualQueryEx;
use winapi::um::processthreadsapi::OpenProcess;
use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
use winapi::um::winnt::{HANDLE, MEMORY_BASIC_INFORMATION};
use winapi::um::wow64apiset::IsWow64Process;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::core::types::{IfaceResult, InterfaceError};

pub const STATUS_INFO_LENGTH_MISMATCH: NTSTATUS = 0xC000_0004_u32 as i32;
pub const STATUS_PARTIAL_COPY: NTSTATUS = 0x8000_000D_u32 as i32;

pub const PROCESS_QUERY_LIMITED_INFORMATION: DWORD = 0x1000;
pub const PROCESS_VM_ACCESS: DWORD = 0x0010 | 0x0020 | 0x0008 | 0x0400; // VM_READ | VM_WRITE | VM_OPERATION | QUERY_INFORMATION

pub const MEM_COMMIT: DWORD = 0x1000;

/// Information classes for NtQueryInformationProcess.
#[repr(u32)]
pub enum ProcessInfoClass {
    ProcessBasicInformation = 0,
    ProcessWow64Information = 26,
    ProcessSequenceNumber = 92,
}

/// Information classes for NtQuerySystemInformation.
#[repr(u32)]
pub enum SystemInfoClass {
    SystemProcessInformation = 5,
}

#[repr(C)]
pub struct ProcessBasicInfo {
    pub exit_status: NTSTATUS,
    pub peb_base_address: u64,
    pub affinity_mask: usize,
    pub base_priority: i32,
    pub unique_process_id: usize,
    pub inherited_from_unique_process_id: usize,
}

/// `SYSTEM_PROCESS_INFORMATION` prefix, x64 layout. The snapshot buffer is a
/// chain of variable-sized records linked by `next_entry_offset`.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SystemProcessEntry {
    pub next_entry_offset: u32,
    pub number_of_threads: u32,
    pub working_set_private_size: u64,
    pub hard_fault_count: u32,
    pub number_of_threads_high_watermark: u32,
    pub cycle_time: u64,
    pub create_time: u64,
    pub user_time: u64,
    pub kernel_time: u64,
    pub image_name: UnicodeString64,
    pub base_priority: i32,
    _pad0: u32,
    pub unique_process_id: u64,
    pub inherited_from_unique_process_id: u64,
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct ListEntry64 {
    pub flink: u64,
    pub blink: u64,
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct ListEntry32 {
    pub flink: u32,
    pub blink: u32,
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct UnicodeString64 {
    pub length: u16,
    pub maximum_length: u16,
    _pad: u32,
    pub buffer: u64,
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct UnicodeString32 {
    pub length: u16,
    pub maximum_length: u16,
    pub buffer: u32,
}

/// `LDR_DATA_TABLE_ENTRY` viewed from its `InMemoryOrderLinks` member, which
/// is where the in-memory-order list nodes point.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LdrEntryView64 {
    pub in_memory_order_links: ListEntry64,
    pub in_initialization_order_links: ListEntry64,
    pub dll_base: u64,
    pub entry_point: u64,
    pub size_of_image: u32,
    _pad: u32,
    pub full_dll_name: UnicodeString64,
    pub base_dll_name: UnicodeString64,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LdrEntryView32 {
    pub in_memory_order_links: ListEntry32,
    pub in_initialization_order_links: ListEntry32,
    pub dll_base: u32,
    pub entry_point: u32,
    pub size_of_image: u32,
    pub full_dll_name: UnicodeString32,
    pub base_dll_name: UnicodeString32,
}

// PEB member offsets we dereference directly instead of mirroring the whole
// structure.
pub const PEB64_IMAGE_BASE: u64 = 0x10;
pub const PEB64_LDR: u64 = 0x18;
pub const PEB32_IMAGE_BASE: u64 = 0x08;
pub const PEB32_LDR: u64 = 0x0C;
pub const LDR64_IN_MEMORY_ORDER_LIST: u64 = 0x20;
pub const LDR32_IN_MEMORY_ORDER_LIST: u64 = 0x14;

#[link(name = "ntdll")]
extern "system" {
    fn NtQueryInformationProcess(
        process_handle: HANDLE,
        process_info_class: ULONG,
        process_info: PVOID,
        process_info_length: ULONG,
        return_length: *mut ULONG,
    ) -> NTSTATUS;

    fn NtQuerySystemInformation(
        system_info_class: ULONG,
        system_info: PVOID,
        system_info_length: ULONG,
        return_length: *mut ULONG,
    ) -> NTSTATUS;

    fn NtReadVirtualMemory(
        process_handle: HANDLE,
        base_address: PVOID,
        buffer: PVOID,
        buffer_size: usize,
        number_of_bytes_read: *mut usize,
    ) -> NTSTATUS;

    fn NtWriteVirtualMemory(
        process_handle: HANDLE,
        base_address: PVOID,
        buffer: PVOID,
        buffer_size: usize,
        number_of_bytes_written: *mut usize,
    ) -> NTSTATUS;
}

pub fn nt_success(status: NTSTATUS) -> bool {
    status >= 0
}

fn nt_error(op: &str, status: NTSTATUS) -> InterfaceError {
    InterfaceError::os(op, format!("status 0x{:08X}", status as u32))
}

/// Safe wrapper for OpenProcess.
pub fn open_process(pid: u32, desired_access: DWORD) -> IfaceResult<HANDLE> {
    let handle = unsafe { OpenProcess(desired_access, FALSE, pid) };
    if handle.is_null() {
        Err(InterfaceError::os("OpenProcess", format!("pid {pid}")))
    } else {
        Ok(handle)
    }
}

/// Safe wrapper for CloseHandle. Closing a null handle is a no-op.
pub fn close_handle(handle: HANDLE) -> IfaceResult<()> {
    if handle.is_null() {
        return Ok(());
    }
    if unsafe { CloseHandle(handle) } == FALSE {
        Err(InterfaceError::os("CloseHandle", "invalid handle"))
    } else {
        Ok(())
    }
}

/// Reads remote memory, tolerating partial copies at region boundaries.
pub fn read_virtual_memory(handle: HANDLE, address: u64, buffer: &mut [u8]) -> IfaceResult<usize> {
    let mut transferred = 0usize;
    let status = unsafe {
        NtReadVirtualMemory(
            handle,
            address as PVOID,
            buffer.as_mut_ptr() as PVOID,
            buffer.len(),
            &mut transferred,
        )
    };
    if nt_success(status) || status == STATUS_PARTIAL_COPY {
        Ok(transferred)
    } else {
        Err(nt_error("NtReadVirtualMemory", status))
    }
}

pub fn write_virtual_memory(handle: HANDLE, address: u64, buffer: &[u8]) -> IfaceResult<usize> {
    let mut transferred = 0usize;
    let status = unsafe {
        NtWriteVirtualMemory(
            handle,
            address as PVOID,
            buffer.as_ptr() as PVOID,
            buffer.len(),
            &mut transferred,
        )
    };
    if nt_success(status) || status == STATUS_PARTIAL_COPY {
        Ok(transferred)
    } else {
        Err(nt_error("NtWriteVirtualMemory", status))
    }
}

/// Queries `ProcessBasicInformation` for the PEB address.
pub fn query_basic_information(handle: HANDLE) -> IfaceResult<ProcessBasicInfo> {
    let mut info: ProcessBasicInfo = unsafe { mem::zeroed() };
    let mut return_length = 0u32;
    let status = unsafe {
        NtQueryInformationProcess(
            handle,
            ProcessInfoClass::ProcessBasicInformation as ULONG,
            &mut info as *mut _ as PVOID,
            mem::size_of::<ProcessBasicInfo>() as ULONG,
            &mut return_length,
        )
    };
    if nt_success(status) {
        Ok(info)
    } else {
        Err(nt_error("NtQueryInformationProcess", status))
    }
}

/// Returns the WOW64 PEB32 address, or zero for a native 64-bit process.
pub fn query_wow64_peb(handle: HANDLE) -> IfaceResult<u64> {
    let mut wow64: usize = 0;
    let mut return_length = 0u32;
    let status = unsafe {
        NtQueryInformationProcess(
            handle,
            ProcessInfoClass::ProcessWow64Information as ULONG,
            &mut wow64 as *mut _ as PVOID,
            mem::size_of::<usize>() as ULONG,
            &mut return_length,
        )
    };
    if nt_success(status) {
        Ok(wow64 as u64)
    } else {
        Err(nt_error("NtQueryInformationProcess", status))
    }
}

/// The monotonically increasing process sequence number, available since
/// Windows 10 RS4. Absent on older builds.
pub fn query_sequence_number(handle: HANDLE) -> Option<u64> {
    let mut sequence = 0u64;
    let mut return_length = 0u32;
    let status = unsafe {
        NtQueryInformationProcess(
            handle,
            ProcessInfoClass::ProcessSequenceNumber as ULONG,
            &mut sequence as *mut _ as PVOID,
            mem::size_of::<u64>() as ULONG,
            &mut return_length,
        )
    };
    nt_success(status).then_some(sequence)
}

pub fn is_wow64_process(handle: HANDLE) -> IfaceResult<bool> {
    let mut wow64 = FALSE;
    if unsafe { IsWow64Process(handle, &mut wow64) } == FALSE {
        return Err(InterfaceError::os("IsWow64Process", "query failed"));
    }
    Ok(wow64 != FALSE)
}

/// Captures the raw `SystemProcessInformation` snapshot, growing the buffer
/// until the kernel stops reporting a length mismatch.
pub fn query_process_snapshot() -> IfaceResult<Vec<u8>> {
    let mut buffer = vec![0u8; 0x10000];
    loop {
        let mut return_length = 0u32;
        let status = unsafe {
            NtQuerySystemInformation(
                SystemInfoClass::SystemProcessInformation as ULONG,
                buffer.as_mut_ptr() as PVOID,
                buffer.len() as ULONG,
                &mut return_length,
            )
        };
        if status == STATUS_INFO_LENGTH_MISMATCH {
            // The process list can grow between calls, leave headroom.
            buffer.resize(return_length as usize + 0x4000, 0);
            continue;
        }
        if !nt_success(status) {
            return Err(nt_error("NtQuerySystemInformation", status));
        }
        buffer.truncate(return_length as usize);
        return Ok(buffer);
    }
}

/// The lowest and highest user-mode addresses on this system.
pub fn application_address_range() -> (u64, u64) {
    let mut info: SYSTEM_INFO = unsafe { mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    (
        info.lpMinimumApplicationAddress as u64,
        info.lpMaximumApplicationAddress as u64,
    )
}

/// Queries the memory region containing `address`, if any.
pub fn virtual_query(handle: HANDLE, address: u64) -> Option<MEMORY_BASIC_INFORMATION> {
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
    let written = unsafe {
        VirtualQueryEx(
            handle,
            address as LPVOID,
            &mut info,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    (written != 0).then_some(info)
}
