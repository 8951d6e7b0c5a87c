use bitflags::bitflags;

bitflags! {
    /// Capabilities requested by the caller of the security context.
    ///
    /// Values follow the SSPI `ISC_REQ_*` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ClientRequestFlags: u32 {
        const DELEGATE = 0x1;
        const MUTUAL_AUTH = 0x2;
        const REPLAY_DETECT = 0x4;
        const SEQUENCE_DETECT = 0x8;
        const CONFIDENTIALITY = 0x10;
        const USE_DCE_STYLE = 0x200;
        const EXTENDED_ERROR = 0x4000;
        const INTEGRITY = 0x10_000;
        const IDENTIFY = 0x20_000;
    }
}

bitflags! {
    /// This flags appears in the KRB_AS_REQ and KRB_TGS_REQ requests to
    /// the KDC and indicates the flags that the client wants set on the tickets.
    ///
    /// [KDCOptions](https://www.rfc-editor.org/rfc/rfc4120#section-5.4.1)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct KdcOptions: u32 {
        const FORWARDABLE = 0x40000000;
        const FORWARDED = 0x20000000;
        const PROXIABLE = 0x10000000;
        const RENEWABLE = 0x00800000;
        const CANONICALIZE = 0x00010000;
        const RENEWABLE_OK = 0x00000010;
    }
}

bitflags! {
    /// This flags appears in the application request (KRB_AP_REQ) and
    /// affects the way the request is processed.
    ///
    /// [APOptions](https://www.rfc-editor.org/rfc/rfc4120#section-5.5.1)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ApOptions: u32 {
        const USE_SESSION_KEY = 0x40000000;
        const MUTUAL_REQUIRED = 0x20000000;
    }
}

bitflags! {
    /// The checksum "Flags" field is used to convey service options or extension negotiation information.
    ///
    /// * [RFC 4121 Checksum Flags Field](https://datatracker.ietf.org/doc/html/rfc4121#section-4.1.1.1).
    /// * [MS-KILE 3.2.5.2 Authenticator Checksum Flags](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-kile/387806fc-ed78-445e-afd8-c5639fe4a90a).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct GssFlags: u32 {
        const GSS_C_DELEG_FLAG = 1;
        const GSS_C_MUTUAL_FLAG = 2;
        const GSS_C_REPLAY_FLAG = 4;
        const GSS_C_SEQUENCE_FLAG = 8;
        const GSS_C_CONF_FLAG = 16;
        const GSS_C_INTEG_FLAG = 32;

        // Windows status codes may be returned in the e-data field of a Kerberos error message.
        const GSS_C_EXTENDED_ERROR_FLAG = 0x4000;
        // The server may identify the client but must not impersonate it.
        const GSS_C_IDENTIFY_FLAG = 0x2000;
        // Three-leg DCE RPC authentication without GSS framing.
        const GSS_C_DCE_STYLE = 0x1000;
    }
}

impl GssFlags {
    pub fn is_dce_style(self) -> bool {
        self.contains(GssFlags::GSS_C_DCE_STYLE)
    }
}

/// Maps the requested capabilities to the AP options and the authenticator checksum flags.
///
/// The AP options start as `MUTUAL_REQUIRED`. Flags are processed in declaration order and
/// `CONFIDENTIALITY` resets the AP options accumulated so far to none.
pub fn map_context_requirements(flags: ClientRequestFlags) -> (ApOptions, GssFlags) {
    let mut ap_options = ApOptions::MUTUAL_REQUIRED;
    let mut gss_flags = GssFlags::empty();

    if flags.contains(ClientRequestFlags::DELEGATE) {
        gss_flags |= GssFlags::GSS_C_DELEG_FLAG;
    }
    if flags.contains(ClientRequestFlags::MUTUAL_AUTH) {
        gss_flags |= GssFlags::GSS_C_MUTUAL_FLAG;
        ap_options |= ApOptions::MUTUAL_REQUIRED;
    }
    if flags.contains(ClientRequestFlags::REPLAY_DETECT) {
        gss_flags |= GssFlags::GSS_C_REPLAY_FLAG;
    }
    if flags.contains(ClientRequestFlags::SEQUENCE_DETECT) {
        gss_flags |= GssFlags::GSS_C_SEQUENCE_FLAG;
    }
    if flags.contains(ClientRequestFlags::CONFIDENTIALITY) {
        ap_options = ApOptions::empty();
        gss_flags |= GssFlags::GSS_C_CONF_FLAG;
    }
    if flags.contains(ClientRequestFlags::USE_DCE_STYLE) {
        gss_flags |= GssFlags::GSS_C_DCE_STYLE;
    }
    if flags.contains(ClientRequestFlags::EXTENDED_ERROR) {
        gss_flags |= GssFlags::GSS_C_EXTENDED_ERROR_FLAG;
    }
    if flags.contains(ClientRequestFlags::INTEGRITY) {
        gss_flags |= GssFlags::GSS_C_INTEG_FLAG;
    }
    if flags.contains(ClientRequestFlags::IDENTIFY) {
        gss_flags |= GssFlags::GSS_C_IDENTIFY_FLAG;
    }

    (ap_options, gss_flags)
}
