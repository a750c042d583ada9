//! DNS-SD registration data: validation, derived names, TXT encoding and
//! the resource records a registration advertises.
//!
//! A registration is either local (this host offers the service) or a proxy
//! (advertised on behalf of another host, with an explicit address). The
//! engine allows one of each at a time.

use crate::dns_parser::{
    encode_name, nsec_type_bitmap, DnsRecord, RData, RRType, MAX_LABEL_LEN,
};
use crate::responder::ServiceVariant;
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// Max length of the service name label between the leading `_` and the
/// protocol, per [RFC 6763 section 7.2](https://www.rfc-editor.org/rfc/rfc6763#section-7.2).
pub const SERVICE_NAME_LEN_MAX: usize = 15;

/// Max length of the encoded TXT payload.
pub const TXT_LEN_MAX: usize = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationKind {
    /// This host provides the service.
    Local,
    /// Advertised on behalf of another host.
    Proxy,
}

/// A validated DNS-SD service registration.
#[derive(Clone, Debug)]
pub struct ServiceRegistration {
    kind: RegistrationKind,
    /// Instance label, e.g. `My Web Server`.
    instance: String,
    /// Service type without domain, e.g. `_http._tcp`.
    service_type: String,
    variant: ServiceVariant,
    port: u16,
    /// Encoded TXT rdata.
    txt: Vec<u8>,
    /// For proxies: the advertised host's full name and address.
    proxy_host: Option<String>,
    proxy_addr: Option<Ipv4Addr>,
}

impl ServiceRegistration {
    pub fn new_local(
        instance: &str,
        service_type: &str,
        domain: &str,
        port: u16,
        txt_pairs: &[(&str, &str)],
    ) -> Result<Self> {
        let variant = check_domain(domain)?;
        check_instance(instance)?;
        check_service_type(service_type)?;
        if port == 0 {
            return Err(Error::InvalidParam("port must be non-zero".to_string()));
        }
        let txt = encode_txt(txt_pairs)?;
        Ok(Self {
            kind: RegistrationKind::Local,
            instance: instance.to_string(),
            service_type: service_type.to_lowercase(),
            variant,
            port,
            txt,
            proxy_host: None,
            proxy_addr: None,
        })
    }

    pub fn new_proxy(
        instance: &str,
        service_type: &str,
        domain: &str,
        port: u16,
        txt_pairs: &[(&str, &str)],
        host: &str,
        addr: Ipv4Addr,
    ) -> Result<Self> {
        let mut reg = Self::new_local(instance, service_type, domain, port, txt_pairs)?;
        if host.is_empty() || host.len() > MAX_LABEL_LEN {
            return Err(Error::InvalidParam(format!(
                "proxy host label '{}' invalid",
                host
            )));
        }
        reg.kind = RegistrationKind::Proxy;
        reg.proxy_host = Some(format!(
            "{}.{}.",
            host.to_lowercase(),
            reg.variant.domain()
        ));
        reg.proxy_addr = Some(addr);
        Ok(reg)
    }

    pub const fn kind(&self) -> RegistrationKind {
        self.kind
    }

    pub const fn variant(&self) -> ServiceVariant {
        self.variant
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn txt(&self) -> &[u8] {
        &self.txt
    }

    /// `<type>.<domain>.`, the shared PTR name, e.g. `_http._tcp.local.`
    pub fn ty_domain(&self) -> String {
        format!("{}.{}.", self.service_type, self.variant.domain())
    }

    /// `<instance>.<type>.<domain>.`, the unique SRV/TXT name.
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.instance, self.ty_domain())
    }

    /// The host the SRV record points at: the proxied host for proxies,
    /// otherwise the running identity's hostname.
    pub fn srv_host(&self, identity_host: &str) -> String {
        match &self.proxy_host {
            Some(host) => host.clone(),
            None => identity_host.to_string(),
        }
    }

    /// Builds the records this registration advertises. `identity_host` is
    /// the full hostname of the active identity on this variant.
    ///
    /// The NSEC record asserts that only SRV and TXT exist under the
    /// instance name, for negative-caching per RFC 6762 section 6.1.
    pub fn records(&self, identity_host: &str) -> Vec<DnsRecord> {
        let fullname = self.fullname();
        let host = self.srv_host(identity_host);

        let mut records = vec![
            DnsRecord::own_shared(&self.ty_domain(), RData::Ptr(fullname.clone())),
            DnsRecord::own(
                &fullname,
                RData::Srv {
                    priority: 0,
                    weight: 0,
                    port: self.port,
                    host: host.clone(),
                },
            ),
            DnsRecord::own(&fullname, RData::Txt(self.txt.clone())),
            DnsRecord::own(
                &fullname,
                RData::Nsec {
                    next_name: fullname.clone(),
                    type_bitmap: nsec_type_bitmap(&[RRType::SRV, RRType::TXT]),
                },
            ),
        ];

        if let Some(addr) = self.proxy_addr {
            records.push(DnsRecord::own(&host, RData::A(addr)));
            records.push(DnsRecord::own(
                &host,
                RData::Nsec {
                    next_name: host.clone(),
                    type_bitmap: nsec_type_bitmap(&[RRType::A]),
                },
            ));
        }

        records
    }
}

fn check_domain(domain: &str) -> Result<ServiceVariant> {
    let trimmed = domain.strip_suffix('.').unwrap_or(domain);
    if trimmed.eq_ignore_ascii_case(ServiceVariant::Mdns.domain()) {
        Ok(ServiceVariant::Mdns)
    } else if trimmed.eq_ignore_ascii_case(ServiceVariant::Xmdns.domain()) {
        Ok(ServiceVariant::Xmdns)
    } else {
        Err(Error::InvalidParam(format!(
            "domain must be 'local' or 'site', got '{}'",
            domain
        )))
    }
}

fn check_instance(instance: &str) -> Result<()> {
    if instance.is_empty() || instance.len() > MAX_LABEL_LEN {
        return Err(Error::InvalidParam(format!(
            "instance name must be 1-{} bytes, got {}",
            MAX_LABEL_LEN,
            instance.len()
        )));
    }
    if instance.contains('.') {
        return Err(Error::InvalidParam(format!(
            "instance name '{}' must not contain dots",
            instance
        )));
    }
    Ok(())
}

/// Validates a service type of the form `_<name>._tcp` or `_<name>._udp`.
pub fn check_service_type(service_type: &str) -> Result<()> {
    let (name, proto) = match service_type.rsplit_once('.') {
        Some(parts) => parts,
        None => {
            return Err(Error::InvalidParam(format!(
                "service type '{}' must be '_name._tcp' or '_name._udp'",
                service_type
            )))
        }
    };

    if proto != "_tcp" && proto != "_udp" {
        return Err(Error::InvalidParam(format!(
            "service protocol must be '_tcp' or '_udp', got '{}'",
            proto
        )));
    }

    let stripped = match name.strip_prefix('_') {
        Some(s) if !s.is_empty() => s,
        _ => {
            return Err(Error::InvalidParam(format!(
                "service name '{}' must start with an underscore",
                name
            )))
        }
    };
    if stripped.len() > SERVICE_NAME_LEN_MAX {
        return Err(Error::InvalidParam(format!(
            "service name '{}' exceeds {} bytes",
            stripped, SERVICE_NAME_LEN_MAX
        )));
    }
    if stripped.contains('.') {
        return Err(Error::InvalidParam(format!(
            "service name '{}' must be a single label",
            stripped
        )));
    }
    Ok(())
}

/// Encodes `key=value` pairs into TXT rdata: each entry length-prefixed.
/// An empty set encodes as a single zero byte.
pub fn encode_txt(pairs: &[(&str, &str)]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (key, value) in pairs {
        let entry = if value.is_empty() {
            key.to_string()
        } else {
            format!("{}={}", key, value)
        };
        if entry.len() > u8::MAX as usize {
            return Err(Error::InvalidParam(format!(
                "TXT entry '{}' exceeds 255 bytes",
                key
            )));
        }
        out.push(entry.len() as u8);
        out.extend_from_slice(entry.as_bytes());
    }
    if out.is_empty() {
        out.push(0);
    }
    if out.len() > TXT_LEN_MAX {
        return Err(Error::InvalidParam(format!(
            "TXT payload is {} bytes, max {}",
            out.len(),
            TXT_LEN_MAX
        )));
    }
    Ok(out)
}

/// Decodes TXT rdata into `(key, value)` pairs; entries without `=` yield
/// an empty value.
pub fn decode_txt(txt: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut offset = 0;
    while offset < txt.len() {
        let length = txt[offset] as usize;
        offset += 1;
        if length == 0 || offset + length > txt.len() {
            break;
        }
        let entry = String::from_utf8_lossy(&txt[offset..offset + length]);
        offset += length;
        match entry.split_once('=') {
            Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
            None => pairs.push((entry.to_string(), String::new())),
        }
    }
    pairs
}

/// Checks that `encoded_name` could be a valid browse target: it must
/// decode under the variant's domain. Used before issuing queries.
pub fn check_browse_domain(name: &str, variant: ServiceVariant) -> Result<()> {
    if !variant.owns_name(name) {
        return Err(Error::InvalidParam(format!(
            "'{}' is not under domain '{}'",
            name,
            variant.domain()
        )));
    }
    // Must also be encodable within the engine's name limits.
    encode_name(name)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        check_service_type, decode_txt, encode_txt, RegistrationKind, ServiceRegistration,
    };
    use crate::dns_parser::{RData, RRType};
    use crate::Error;
    use std::net::Ipv4Addr;

    #[test]
    fn test_service_type_validation() {
        assert!(check_service_type("_http._tcp").is_ok());
        assert!(check_service_type("_osc._udp").is_ok());
        assert!(check_service_type("_http._xxx").is_err());
        assert!(check_service_type("http._tcp").is_err());
        assert!(check_service_type("_way-too-long-service-name._tcp").is_err());
        assert!(check_service_type("plain").is_err());
    }

    #[test]
    fn test_local_registration_names_and_records() {
        let reg = ServiceRegistration::new_local(
            "My Web",
            "_http._tcp",
            "local",
            8080,
            &[("path", "/index")],
        )
        .unwrap();
        assert_eq!(reg.kind(), RegistrationKind::Local);
        assert_eq!(reg.ty_domain(), "_http._tcp.local.");
        assert_eq!(reg.fullname(), "My Web._http._tcp.local.");

        let records = reg.records("myhost.local.");
        assert_eq!(records.len(), 4);
        // PTR is shared (no cache flush), the rest are unique.
        assert!(!records[0].cache_flush());
        assert!(records[1].cache_flush());
        match records[1].rdata() {
            RData::Srv { port, host, .. } => {
                assert_eq!(*port, 8080);
                assert_eq!(host, "myhost.local.");
            }
            other => panic!("expected SRV, got {:?}", other),
        }
        assert_eq!(records[3].rr_type(), RRType::NSEC);
    }

    #[test]
    fn test_proxy_registration_advertises_host_address() {
        let reg = ServiceRegistration::new_proxy(
            "Printer",
            "_ipp._tcp",
            "local",
            631,
            &[],
            "printerbox",
            Ipv4Addr::new(192, 168, 1, 50),
        )
        .unwrap();
        assert_eq!(reg.kind(), RegistrationKind::Proxy);

        let records = reg.records("myhost.local.");
        assert_eq!(records.len(), 6);
        match records[1].rdata() {
            RData::Srv { host, .. } => assert_eq!(host, "printerbox.local."),
            other => panic!("expected SRV, got {:?}", other),
        }
        let a_record = records
            .iter()
            .find(|r| r.rr_type() == RRType::A)
            .expect("proxy A record");
        assert_eq!(a_record.name(), "printerbox.local.");
    }

    #[test]
    fn test_registration_rejects_bad_input() {
        assert!(matches!(
            ServiceRegistration::new_local("x", "_http._tcp", "example.com", 80, &[]),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            ServiceRegistration::new_local("", "_http._tcp", "local", 80, &[]),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            ServiceRegistration::new_local("x", "_http._tcp", "local", 0, &[]),
            Err(Error::InvalidParam(_))
        ));

        let big_value = "v".repeat(300);
        assert!(matches!(
            ServiceRegistration::new_local("x", "_http._tcp", "local", 80, &[("k", &big_value)]),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn test_txt_roundtrip() {
        let encoded = encode_txt(&[("key1", "val1"), ("flag", "")]).unwrap();
        let decoded = decode_txt(&encoded);
        assert_eq!(
            decoded,
            vec![
                ("key1".to_string(), "val1".to_string()),
                ("flag".to_string(), String::new())
            ]
        );

        // Empty TXT encodes as a single zero byte.
        assert_eq!(encode_txt(&[]).unwrap(), vec![0]);
        assert!(decode_txt(&[0]).is_empty());
    }

    #[test]
    fn test_xmdns_domain_registration() {
        let reg =
            ServiceRegistration::new_local("Sensor", "_osc._udp", "site", 9000, &[]).unwrap();
        assert_eq!(reg.ty_domain(), "_osc._udp.site.");
    }
}
