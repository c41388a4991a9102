//! VCPU lifecycle
//!
//! A [`Vcpu`] virtualizes the logical processor it is created on. The lifecycle is strictly
//! monotonic:
//!
//! ```text
//! Off -> Initializing -> Launching -> Running -> Terminating -> Terminated
//! ```
//!
//! Any failure before the guest runs jumps directly to `Terminated`. Once launched, the guest is
//! the operating system that called [`Vcpu::launch`]: every VM exit goes through
//! [`Vcpu::handle_exit`], which either resumes the guest or leaves VMX operation and continues the
//! guest natively (devirtualization).

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU16, Ordering};

use utils::{HostPhysAddr, HostVirtAddr, PAGE_SIZE};
use vmx::bitmaps::{
    EntryControls, EptCapability, ExceptionBitmap, ExitControls, PageFaultErrorCode,
    PinbasedControls, PrimaryControls, SecondaryControls,
};
use vmx::check;
use vmx::msr::{self, IoBitmaps, Msr, MsrBitmaps};
use vmx::{ExitReason, VmcsField, VmxBasicInfo, VmxError, VmxFieldError, VmxInstructionError};

use crate::ept::Ept;
use crate::error::VcpuError;
use crate::frame::{Context, TransitionFrame};
use crate::hal::{ProcessorState, VmxHal};
use crate::handler::ExitHandler;
use crate::interrupt::InterruptInfo;
use crate::regs::{DescriptorTable, HostSegment, RFlags, Segment, SegmentRegister};
use crate::segment::resolve_segment;
use crate::trampoline;
use crate::vmcs::{
    ControlFields, ControlMsr, EntryFields, ExitFields, GuestFields, HostFields, VmcsAccess,
};

/// The next VPID to hand out. VPID 0 is reserved for the host.
static NEXT_VPID: AtomicU16 = AtomicU16::new(1);

fn allocate_vpid() -> u16 {
    loop {
        let vpid = NEXT_VPID.fetch_add(1, Ordering::Relaxed);
        if vpid != 0 {
            return vpid;
        }
    }
}

// ———————————————————————————————— VMX Regions ————————————————————————————————— //

/// A VMXON or VMCS region.
#[repr(C, align(4096))]
struct VmxRegion([u8; PAGE_SIZE]);

impl VmxRegion {
    const fn new() -> Self {
        Self([0; PAGE_SIZE])
    }

    /// The revision identifier lives in the first 31 bits of the region.
    fn set_revision(&mut self, revision: u32) {
        self.0[..4].copy_from_slice(&(revision & 0x7FFF_FFFF).to_le_bytes());
    }
}

/// The guest registers a VM exit replaces with the host state, and that are not part of the
/// [`Context`]. GDTR and IDTR limits are forced to 0xFFFF on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RootState {
    cr0: u64,
    cr3: u64,
    cr4: u64,
    dr7: u64,
    debugctl: u64,
    gdtr: DescriptorTable,
    idtr: DescriptorTable,
    fs_base: u64,
    gs_base: u64,
}

/// Storage for FXSAVE, used to preserve the guest FPU and SSE state across exit handling.
#[repr(C, align(16))]
struct FxSaveArea([u8; 512]);

// ——————————————————————————————— VCPU State ——————————————————————————————— //

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VcpuState {
    Off,
    Initializing,
    Launching,
    Running,
    Terminating,
    Terminated,
}

/// What the exit trampoline does after an exit has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Re-enter the guest with the guest context.
    Resume,
    /// VMX operation has been left, continue with the exit context in root mode.
    Devirtualize,
}

/// Why the VCPU could not run the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchError {
    pub error: VmxError,
    /// The VM-instruction error reported by the processor, if any.
    pub instruction_error: Option<VmxInstructionError>,
    /// The exit reason, when the VMCS could still be read.
    pub exit_reason: Option<ExitReason>,
}

// —————————————————————————————————— VCPU —————————————————————————————————— //

/// A virtual CPU, bound to the logical processor it is created on.
///
/// The VCPU holds every structure handed to the hardware, it must not move once initialized and
/// must never be sent to another processor.
#[repr(C)]
pub struct Vcpu<'h, H: VmxHal> {
    /// Must stay the first field: the exit trampoline recovers the VCPU from the frame address.
    frame: TransitionFrame,
    vmxon: VmxRegion,
    vmcs: VmxRegion,
    msr_bitmaps: MsrBitmaps,
    io_bitmaps: IoBitmaps,
    fxsave: FxSaveArea,
    ept: Ept,
    hal: H,
    handler: Option<&'h mut dyn ExitHandler<H>>,
    state: VcpuState,
    vpid: u16,
    vmx_operation: bool,
    suppress_rip_adjust: bool,
    launch_error: Option<LaunchError>,
    _not_send: PhantomData<*const ()>,
}

impl<H: VmxHal> VmcsAccess for Vcpu<'_, H> {
    fn vmcs_read(&self, field: VmcsField) -> Result<u64, VmxError> {
        self.hal.vmread(field)
    }

    fn vmcs_write(&mut self, field: VmcsField, value: u64) -> Result<(), VmxError> {
        self.hal.vmwrite(field, value)
    }
}

impl<'h, H: VmxHal> Vcpu<'h, H> {
    /// A VCPU in the `Off` state.
    ///
    /// Exits are delegated to the handler given to [`Vcpu::initialize`]. Without a handler the
    /// first VM exit, whatever its reason, terminates the VCPU: use a
    /// [`PassthroughHandler`](crate::PassthroughHandler) to keep the guest running.
    pub fn new(hal: H) -> Self {
        Self {
            frame: TransitionFrame::new(),
            vmxon: VmxRegion::new(),
            vmcs: VmxRegion::new(),
            msr_bitmaps: MsrBitmaps::new(),
            io_bitmaps: IoBitmaps::new(),
            fxsave: FxSaveArea([0; 512]),
            ept: Ept::new(),
            hal,
            handler: None,
            state: VcpuState::Off,
            vpid: 0,
            vmx_operation: false,
            suppress_rip_adjust: false,
            launch_error: None,
            _not_send: PhantomData,
        }
    }

    // ——————————————————————————————— Lifecycle ——————————————————————————————— //

    /// Enters VMX operation and configures the VMCS so that the guest mirrors the current
    /// processor.
    ///
    /// On failure VMX operation is left and the VCPU is `Terminated`.
    pub fn initialize(
        &mut self,
        handler: Option<&'h mut dyn ExitHandler<H>>,
    ) -> Result<(), VcpuError> {
        self.expect_state(VcpuState::Off)?;
        self.handler = handler;
        self.frame.dispatch = Some(trampoline::exit_dispatch::<H>);

        if let Err(err) = self.activate() {
            log::error!("VCPU initialization failed: {:?}", err);
            self.leave_vmx_operation();
            self.state = VcpuState::Terminated;
            return Err(err);
        }

        self.state = VcpuState::Initializing;
        log::info!("VCPU {} initialized", self.vpid);
        Ok(())
    }

    /// Launches the guest.
    ///
    /// On success this returns in VMX non-root operation: the caller is now the guest.
    pub fn launch(&mut self) -> Result<(), VcpuError> {
        self.expect_state(VcpuState::Initializing)?;
        self.state = VcpuState::Launching;
        log::info!("VCPU {} launching", self.vpid);

        if let Err(err) = self.hal.launch() {
            self.record_failure(err);
            self.leave_vmx_operation();
            self.state = VcpuState::Terminated;
            return Err(err.into());
        }

        // A failed VM entry runs the exit pass before getting here, through the host RSP rather
        // than through `self`.
        let state = unsafe { core::ptr::read_volatile(&self.state) };
        match state {
            VcpuState::Launching => self.state = VcpuState::Running,
            // The VM entry itself failed and the exit pass devirtualized.
            VcpuState::Terminated => {
                if let Some(failure) = unsafe { core::ptr::read_volatile(&self.launch_error) } {
                    return Err(failure.error.into());
                }
            }
            _ => (),
        }
        Ok(())
    }

    /// Requests termination: the next VM exit leaves VMX operation instead of resuming the guest.
    pub fn terminate(&mut self) -> Result<(), VcpuError> {
        self.expect_state(VcpuState::Running)?;
        self.state = VcpuState::Terminating;
        log::info!("VCPU {} terminating", self.vpid);
        Ok(())
    }

    /// Arms an event for delivery on the next VM entry.
    ///
    /// The descriptor is sanitized first, so that it is always architecturally valid. An invalid
    /// descriptor is ignored.
    pub fn inject(&mut self, info: InterruptInfo) -> Result<(), VcpuError> {
        if !info.valid() {
            log::debug!("Ignoring injection of an invalid event: {:?}", info);
            return Ok(());
        }

        let sanitized = info.sanitized();
        if sanitized != info {
            log::debug!("Sanitized injected event {:?} into {:?}", info, sanitized);
        }

        let raw = sanitized.to_entry_info();
        check::validate_entry_interruption(raw)?;
        self.set_entry_interruption_info(raw)?;
        if sanitized.error_code_valid() {
            self.set_entry_exception_error_code(sanitized.error_code())?;
        }

        match sanitized.rip_adjust() {
            Some(length) => self.set_entry_instruction_length(length)?,
            None if sanitized.kind().is_software() => {
                let length = self.exit_instruction_length()?;
                self.set_entry_instruction_length(length)?;
            }
            None => (),
        }
        Ok(())
    }

    /// Do not advance the guest RIP at the end of the current exit.
    pub fn suppress_rip_adjust(&mut self) {
        self.suppress_rip_adjust = true;
    }

    /// Handles a VM exit.
    ///
    /// Called by the exit trampoline once the guest registers are saved in the guest context.
    /// Errors are not propagated: they are logged and the guest is devirtualized.
    pub fn handle_exit(&mut self) -> ExitAction {
        match self.dispatch_exit() {
            Ok(action) => action,
            Err(err) => {
                log::error!("VCPU {} failed to handle VM exit: {:?}", self.vpid, err);
                self.devirtualize();
                ExitAction::Devirtualize
            }
        }
    }

    /// Called by the exit trampoline when VMRESUME falls through, with the RFLAGS it left.
    pub fn resume_failed(&mut self, rflags: u64) {
        let flags = RFlags::from_bits_truncate(rflags);
        let error = if flags.contains(RFlags::ZERO_FLAG) {
            let instruction_error = self.instruction_error().unwrap_or(VmxInstructionError::Unknown);
            VmxError::VmFailValid(instruction_error)
        } else {
            VmxError::VmFailInvalid
        };
        log::error!("VCPU {} VMRESUME failed: {:?}", self.vpid, error);
        self.record_failure(error);
        self.devirtualize();
    }

    // ——————————————————————————————— Accessors ——————————————————————————————— //

    pub fn state(&self) -> VcpuState {
        self.state
    }

    pub fn vpid(&self) -> u16 {
        self.vpid
    }

    /// The exit handler. It is not available while it handles an exit.
    pub fn exit_handler(&mut self) -> Option<&mut (dyn ExitHandler<H> + 'h)> {
        self.handler.as_deref_mut()
    }

    pub fn set_exit_handler(&mut self, handler: Option<&'h mut dyn ExitHandler<H>>) {
        self.handler = handler;
    }

    pub fn ept(&self) -> &Ept {
        &self.ept
    }

    pub fn ept_mut(&mut self) -> &mut Ept {
        &mut self.ept
    }

    /// The guest registers at the current exit, modified by the exit handler.
    pub fn exit_context(&self) -> &Context {
        &self.frame.exit_context
    }

    pub fn exit_context_mut(&mut self) -> &mut Context {
        &mut self.frame.exit_context
    }

    /// The registers the guest is resumed with.
    pub fn guest_context(&self) -> &Context {
        &self.frame.guest_context
    }

    #[cfg(test)]
    pub(crate) fn guest_context_mut(&mut self) -> &mut Context {
        &mut self.frame.guest_context
    }

    pub fn launch_error(&self) -> Option<LaunchError> {
        self.launch_error
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// The event that caused the current exit, if any.
    pub fn exit_interrupt_info(&self) -> Result<InterruptInfo, VmxError> {
        self.exit_interruption_info()
    }

    pub(crate) fn frame(&self) -> &TransitionFrame {
        &self.frame
    }

    pub(crate) fn fxsave_area(&mut self) -> *mut u8 {
        self.fxsave.0.as_mut_ptr()
    }

    // ———————————————————————————— Initialization ————————————————————————————— //

    fn activate(&mut self) -> Result<(), VcpuError> {
        if self.hal.cpuid(1, 0).ecx & vmx::CPUID_ECX_VMX_MASK == 0 {
            return Err(VmxError::VmxNotSupported.into());
        }
        let feature_control = self.hal.read_msr(msr::FEATURE_CONTROL);
        if let Some(value) = vmx::check_feature_control(feature_control)? {
            log::debug!("Locking IA32_FEATURE_CONTROL: 0x{:x}", value);
            self.hal.write_msr(msr::FEATURE_CONTROL, value);
        }

        let basic = VmxBasicInfo::from_msr(self.hal.read_msr(msr::VMX_BASIC));
        if basic.vmcs_width as usize > PAGE_SIZE {
            log::error!("VMCS regions of {} bytes are not supported", basic.vmcs_width);
            return Err(VmxError::FeatureNotSupported.into());
        }

        // CR0 and CR4 must honor the VMX fixed bits from now on.
        let mut state = self.hal.capture_state();
        state.cr0 = self.fixed_bits(state.cr0, msr::VMX_CR0_FIXED0, msr::VMX_CR0_FIXED1);
        state.cr4 =
            self.fixed_bits(state.cr4 | vmx::CR4_VMXE, msr::VMX_CR4_FIXED0, msr::VMX_CR4_FIXED1);
        self.hal.write_cr0(state.cr0);
        self.hal.write_cr4(state.cr4);

        self.vmxon.set_revision(basic.revision);
        self.vmcs.set_revision(basic.revision);
        let vmxon = self.physical(HostVirtAddr::of(&self.vmxon))?;
        let vmcs = self.physical(HostVirtAddr::of(&self.vmcs))?;

        self.hal
            .vmxon(vmxon)
            .map_err(|err| err.set_field(VmxFieldError::VmxonRegion))?;
        self.vmx_operation = true;
        self.hal
            .vmclear(vmcs)
            .map_err(|err| err.set_field(VmxFieldError::VmcsRegion))?;
        self.hal
            .vmptrld(vmcs)
            .map_err(|err| err.set_field(VmxFieldError::VmcsRegion))?;

        self.vpid = allocate_vpid();
        self.setup_controls(&basic, &state)?;
        self.setup_host_state(&state)?;
        self.setup_guest_state(&state)?;
        self.check()
    }

    fn setup_controls(
        &mut self,
        basic: &VmxBasicInfo,
        state: &ProcessorState,
    ) -> Result<(), VcpuError> {
        let pin = self.control_msr(basic, msr::VMX_PINBASED_CTLS, msr::VMX_TRUE_PINBASED_CTLS);
        let primary =
            self.control_msr(basic, msr::VMX_PROCBASED_CTLS, msr::VMX_TRUE_PROCBASED_CTLS);
        let exit = self.control_msr(basic, msr::VMX_EXIT_CTLS, msr::VMX_TRUE_EXIT_CTLS);
        let entry = self.control_msr(basic, msr::VMX_ENTRY_CTLS, msr::VMX_TRUE_ENTRY_CTLS);
        let secondary = ControlMsr {
            spec: self.hal.read_msr(msr::VMX_PROCBASED_CTLS2),
            true_spec: None,
        };

        let allowed = vmx::secondary_controls_capabilities(primary.spec, secondary.spec)?;
        let required = SecondaryControls::ENABLE_EPT | SecondaryControls::ENABLE_VPID;
        if !allowed.contains(required) {
            log::error!("EPT and VPID are required, allowed secondary controls: {:?}", allowed);
            return Err(VmxError::FeatureNotSupported.into());
        }
        let optional = SecondaryControls::ENABLE_RDTSCP
            | SecondaryControls::ENABLE_INVPCID
            | SecondaryControls::ENABLE_XSAVES_XRSTORS;

        self.configure_pin_based_controls(PinbasedControls::empty(), &pin)?;
        self.configure_primary_controls(
            PrimaryControls::USE_MSR_BITMAPS | PrimaryControls::SECONDARY_CONTROLS,
            &primary,
        )?;
        self.configure_secondary_controls(required | (optional & allowed), &secondary)?;
        self.configure_exit_controls(
            ExitControls::HOST_ADDRESS_SPACE_SIZE | ExitControls::SAVE_DEBUG_CONTROLS,
            &exit,
        )?;
        self.configure_entry_controls(
            EntryControls::IA32E_MODE_GUEST | EntryControls::LOAD_DEBUG_CONTROLS,
            &entry,
        )?;

        self.set_vpid(self.vpid)?;
        self.set_exception_bitmap(ExceptionBitmap::empty())?;
        self.set_page_fault_error_code_mask(PageFaultErrorCode::empty())?;
        self.set_page_fault_error_code_match(PageFaultErrorCode::empty())?;
        self.vmcs_write(VmcsField::Cr3TargetCount, 0)?;
        self.vmcs_write(VmcsField::VmExitMsrStoreCount, 0)?;
        self.vmcs_write(VmcsField::VmExitMsrLoadCount, 0)?;
        self.vmcs_write(VmcsField::VmEntryMsrLoadCount, 0)?;

        // Every MSR and I/O port is passed through. The I/O bitmaps are not enabled.
        self.msr_bitmaps.allow_all();
        self.io_bitmaps.allow_all();
        let msr_bitmaps = self.physical(HostVirtAddr::of(&self.msr_bitmaps))?;
        let io_bitmap_a = self.physical(HostVirtAddr::of(self.io_bitmaps.bitmap_a()))?;
        let io_bitmap_b = self.physical(HostVirtAddr::of(self.io_bitmaps.bitmap_b()))?;
        self.set_msr_bitmap(msr_bitmaps)?;
        self.set_io_bitmaps(io_bitmap_a, io_bitmap_b)?;

        let ept_caps = EptCapability::from_bits_truncate(self.hal.read_msr(msr::VMX_EPT_VPID_CAP));
        let hal = &self.hal;
        self.ept.identity_map(ept_caps, |addr| hal.virt_to_phys(addr))?;
        self.set_ept_pointer(self.ept.eptp())
            .map_err(|err| err.set_field(VmxFieldError::EptPointer))?;
        self.set_vmcs_link_pointer(vmx::VMCS_LINK_POINTER_NONE)?;

        // The guest owns its control registers.
        self.set_cr0_guest_host_mask(0)?;
        self.set_cr4_guest_host_mask(0)?;
        self.set_cr0_read_shadow(state.cr0)?;
        self.set_cr4_read_shadow(state.cr4)?;
        Ok(())
    }

    fn setup_host_state(&mut self, state: &ProcessorState) -> Result<(), VcpuError> {
        self.set_host_cr0_raw(state.cr0)?;
        self.set_host_cr3(state.cr3)?;
        self.set_host_cr4_raw(state.cr4)?;

        let tr_base = resolve_segment(self.hal.gdt(&state.gdtr), state.tr).base;
        for role in HostSegment::ALL {
            let (selector, base) = match role {
                HostSegment::Es => (state.es, 0),
                HostSegment::Cs => (state.cs, 0),
                HostSegment::Ss => (state.ss, 0),
                HostSegment::Ds => (state.ds, 0),
                HostSegment::Fs => (state.fs, self.hal.read_msr(msr::IA32_FS_BASE)),
                HostSegment::Gs => (state.gs, self.hal.read_msr(msr::IA32_GS_BASE)),
                HostSegment::Tr => (state.tr, tr_base),
            };
            self.set_host_segment(role, selector & !0b111, base)?;
        }

        self.set_host_gdtr_base(state.gdtr.base)?;
        self.set_host_idtr_base(state.idtr.base)?;
        let (cs, esp, eip) = self.sysenter();
        self.set_host_sysenter(cs, esp, eip)?;

        let rsp = HostVirtAddr::of(&self.frame.guest_context).as_u64();
        self.set_host_rsp(rsp)?;
        self.set_host_rip(self.hal.exit_entry_point())?;
        Ok(())
    }

    fn setup_guest_state(&mut self, state: &ProcessorState) -> Result<(), VcpuError> {
        self.set_guest_cr0_raw(state.cr0)?;
        self.set_guest_cr3(state.cr3)?;
        self.set_guest_cr4_raw(state.cr4)?;
        self.set_guest_dr7(state.dr7)?;
        self.set_guest_debugctl(self.hal.read_msr(msr::IA32_DEBUGCTL))?;
        self.set_guest_rflags(RFlags::from_bits_truncate(state.rflags))?;
        self.set_guest_gdtr(&state.gdtr)?;
        self.set_guest_idtr(&state.idtr)?;

        let gdt = self.hal.gdt(&state.gdtr);
        let segments: [Segment; 8] = SegmentRegister::ALL.map(|role| {
            let selector = match role {
                SegmentRegister::Es => state.es,
                SegmentRegister::Cs => state.cs,
                SegmentRegister::Ss => state.ss,
                SegmentRegister::Ds => state.ds,
                SegmentRegister::Fs => state.fs,
                SegmentRegister::Gs => state.gs,
                SegmentRegister::Ldtr => state.ldtr,
                SegmentRegister::Tr => state.tr,
            };
            resolve_segment(gdt, selector)
        });
        for (role, mut segment) in SegmentRegister::ALL.into_iter().zip(segments) {
            // In 64 bits mode the FS and GS bases come from MSRs.
            match role {
                SegmentRegister::Fs => segment.base = self.hal.read_msr(msr::IA32_FS_BASE),
                SegmentRegister::Gs => segment.base = self.hal.read_msr(msr::IA32_GS_BASE),
                _ => (),
            }
            self.set_guest_segment(role, &segment)?;
        }

        let (cs, esp, eip) = self.sysenter();
        self.set_guest_sysenter(cs, esp, eip)?;
        Ok(())
    }

    /// Software checks of the state the processor validates on VM entry.
    fn check(&self) -> Result<(), VcpuError> {
        let cr0_fixed_0 = self.hal.read_msr(msr::VMX_CR0_FIXED0);
        let cr0_fixed_1 = self.hal.read_msr(msr::VMX_CR0_FIXED1);
        let cr4_fixed_0 = self.hal.read_msr(msr::VMX_CR4_FIXED0);
        let cr4_fixed_1 = self.hal.read_msr(msr::VMX_CR4_FIXED1);

        let crs = [
            (VmcsField::HostCr0, VmxFieldError::HostCr0, cr0_fixed_0, cr0_fixed_1),
            (VmcsField::HostCr4, VmxFieldError::HostCr4, cr4_fixed_0, cr4_fixed_1),
            (VmcsField::GuestCr0, VmxFieldError::GuestCr0, cr0_fixed_0, cr0_fixed_1),
            (VmcsField::GuestCr4, VmxFieldError::GuestCr4, cr4_fixed_0, cr4_fixed_1),
        ];
        for (field, error_field, fixed_0, fixed_1) in crs {
            let cr = self.vmcs_read(field)?;
            check::validate_cr(cr, fixed_0, fixed_1).map_err(|err| err.set_field(error_field))?;
        }

        for role in HostSegment::ALL {
            check::validate_host_selector(self.host_selector(role)?, role.error_field())?;
        }
        check::validate_guest_rflags(self.vmcs_read(VmcsField::GuestRflags)?)?;
        Ok(())
    }

    fn control_msr(&self, basic: &VmxBasicInfo, spec: Msr, true_spec: Msr) -> ControlMsr {
        ControlMsr {
            spec: self.hal.read_msr(spec),
            true_spec: basic.support_true_ctls.then(|| self.hal.read_msr(true_spec)),
        }
    }

    fn fixed_bits(&self, cr: u64, fixed_0: Msr, fixed_1: Msr) -> u64 {
        (cr | self.hal.read_msr(fixed_0)) & self.hal.read_msr(fixed_1)
    }

    fn sysenter(&self) -> (u32, u64, u64) {
        (
            self.hal.read_msr(msr::SYSENTER_CS) as u32,
            self.hal.read_msr(msr::SYSENTER_ESP),
            self.hal.read_msr(msr::SYSENTER_EIP),
        )
    }

    fn physical(&self, addr: HostVirtAddr) -> Result<HostPhysAddr, VcpuError> {
        self.hal
            .virt_to_phys(addr)
            .ok_or(VcpuError::UnmappedAddress(addr))
    }

    // —————————————————————————————— Exit Handling ————————————————————————————— //

    fn dispatch_exit(&mut self) -> Result<ExitAction, VcpuError> {
        let mut context = self.frame.guest_context;
        context.rsp = self.guest_rsp()?;
        context.rip = self.guest_rip()?;
        context.rflags = self.guest_rflags()?.bits();
        self.frame.exit_context = context;
        self.suppress_rip_adjust = false;
        if self.state == VcpuState::Launching {
            self.state = VcpuState::Running;
        }

        let reason = self.exit_reason()?;
        if reason.entry_failure {
            log::error!("VCPU {} VM entry failed: {:?}", self.vpid, reason.basic);
            self.launch_error = Some(LaunchError {
                error: VmxError::Misconfigured(VmxFieldError::Unknown),
                instruction_error: None,
                exit_reason: Some(reason),
            });
            self.suppress_rip_adjust = true;
            self.state = VcpuState::Terminating;
        } else {
            self.call_handler()?;
        }

        if !self.suppress_rip_adjust {
            let length = self.exit_instruction_length()? as u64;
            self.frame.exit_context.rip = self.frame.exit_context.rip.wrapping_add(length);
        }

        if self.state == VcpuState::Terminating {
            self.devirtualize();
            log::info!("VCPU {} devirtualized", self.vpid);
            return Ok(ExitAction::Devirtualize);
        }

        let context = self.frame.exit_context;
        self.set_guest_rsp(context.rsp)?;
        self.set_guest_rip(context.rip)?;
        self.set_guest_rflags(RFlags::from_bits_truncate(context.rflags))?;
        self.frame.guest_context = context;
        Ok(ExitAction::Resume)
    }

    fn call_handler(&mut self) -> Result<(), VcpuError> {
        match self.handler.take() {
            Some(handler) => {
                let result = handler.handle(self);
                // The handler may have installed a replacement.
                if self.handler.is_none() {
                    self.handler = Some(handler);
                }
                result
            }
            None => {
                log::warn!("VCPU {} has no exit handler, terminating", self.vpid);
                if self.state == VcpuState::Running {
                    self.state = VcpuState::Terminating;
                }
                Ok(())
            }
        }
    }

    /// Records a failure to enter the guest.
    fn record_failure(&mut self, error: VmxError) {
        let exit_reason = if self.vmx_operation {
            self.exit_reason().ok()
        } else {
            None
        };
        self.launch_error = Some(LaunchError {
            error,
            instruction_error: error.instruction_error(),
            exit_reason,
        });
        log::error!("VCPU {} failed to run the guest: {:?}", self.vpid, error);
    }

    /// Leaves VMX operation after a VM exit, the guest then continues in root mode.
    ///
    /// The registers the processor replaced with the host state on the exit are reloaded from
    /// the guest-state area. The general purpose registers, RSP, RIP and RFLAGS are restored by
    /// the exit trampoline from the exit context.
    fn devirtualize(&mut self) {
        let root = match self.root_state() {
            Ok(root) => Some(root),
            Err(err) => {
                log::warn!("VCPU {} cannot read the guest state: {:?}", self.vpid, err);
                None
            }
        };
        self.leave_vmx_operation();
        if let Some(root) = root {
            self.load_root_state(&root);
        }
        self.state = VcpuState::Terminated;
    }

    fn root_state(&self) -> Result<RootState, VmxError> {
        Ok(RootState {
            cr0: self.guest_cr0_raw()?,
            cr3: self.guest_cr3()?,
            cr4: self.guest_cr4_raw()?,
            dr7: self.guest_dr7()?,
            debugctl: self.guest_debugctl()?,
            gdtr: self.guest_gdtr()?,
            idtr: self.guest_idtr()?,
            fs_base: self.guest_base(SegmentRegister::Fs)?,
            gs_base: self.guest_base(SegmentRegister::Gs)?,
        })
    }

    /// Must run outside of VMX operation: the guest CR4 may not keep the VMX fixed bits.
    fn load_root_state(&mut self, root: &RootState) {
        let hal = &mut self.hal;
        hal.write_cr0(root.cr0);
        hal.write_cr4(root.cr4);
        hal.write_cr3(root.cr3);
        hal.load_gdtr(&root.gdtr);
        hal.load_idtr(&root.idtr);
        hal.write_dr7(root.dr7);
        hal.write_msr(msr::IA32_DEBUGCTL, root.debugctl);
        hal.write_msr(msr::IA32_FS_BASE, root.fs_base);
        hal.write_msr(msr::IA32_GS_BASE, root.gs_base);
    }

    /// Clears the VMCS and executes VMXOFF, failures are only logged.
    fn leave_vmx_operation(&mut self) {
        if !self.vmx_operation {
            return;
        }
        match self.physical(HostVirtAddr::of(&self.vmcs)) {
            Ok(vmcs) => {
                if let Err(err) = self.hal.vmclear(vmcs) {
                    log::warn!("VMCLEAR failed: {:?}", err);
                }
            }
            Err(err) => log::warn!("Cannot clear the VMCS: {:?}", err),
        }
        if let Err(err) = self.hal.vmxoff() {
            log::warn!("VMXOFF failed: {:?}", err);
        }
        self.vmx_operation = false;
    }

    fn expect_state(&self, expected: VcpuState) -> Result<(), VcpuError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(VcpuError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
