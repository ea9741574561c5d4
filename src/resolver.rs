//! Finds the existing equipment mailbox for a device. There is no create path: a device whose
//! mailbox cannot be found is reported, never provisioned.

use log::debug;
use serde_json::json;
use crate::exchange::{params, ExchangeClient, ExchangeError, Mailbox};

/// Recipient types searched by the typed wildcard step, most specific first.
pub const RECIPIENT_TYPES: [&str; 4] = ["EquipmentMailbox", "RoomMailbox", "SharedMailbox", "UserMailbox"];


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveStep {
    PrimaryAddress,
    RecipientAddress,
    ProxyAddress,
    LocalPartWildcard,
    RecipientType,
    Legacy,
}

impl ResolveStep {
    /// The cmdlet a step depends on.
    pub fn cmdlet(&self) -> &'static str {
        match self {
            ResolveStep::PrimaryAddress => "Get-EXOMailbox",
            ResolveStep::Legacy => "Get-Mailbox",
            _ => "Get-EXORecipient",
        }
    }
}

const MODERN_STEPS: [ResolveStep; 5] = [
    ResolveStep::PrimaryAddress,
    ResolveStep::RecipientAddress,
    ResolveStep::ProxyAddress,
    ResolveStep::LocalPartWildcard,
    ResolveStep::RecipientType,
];

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedMailbox {
    pub mailbox: Mailbox,
    pub step: ResolveStep,
}


pub struct MailboxResolver {
    client: ExchangeClient,
}

impl MailboxResolver {
    pub fn new(client: ExchangeClient) -> Self {
        MailboxResolver { client }
    }

    pub async fn resolve(&self, local_part: &str, domain: &str) -> Result<Option<ResolvedMailbox>, ExchangeError> {
        let local = local_part.trim().to_lowercase();
        let address = format!("{}@{}", local, domain.trim().to_lowercase());

        let mut unavailable: Vec<String> = Vec::new();
        for step in MODERN_STEPS {
            if unavailable.iter().any(|c| c == step.cmdlet()) {
                debug!("Skipping {:?} for {}: {} unavailable", step, address, step.cmdlet());
                continue;
            }
            match self.run_step(step, &local, &address).await {
                Ok(Some(mailbox)) => {
                    debug!("Resolved {} to {} via {:?}", address, mailbox.primary_smtp(), step);
                    return Ok(Some(ResolvedMailbox { mailbox, step }));
                },
                Ok(None) => debug!("{:?} found nothing for {}", step, address),
                Err(e) if e.is_fatal() => return Err(e),
                Err(ExchangeError::CmdletUnavailable(cmdlet)) => {
                    debug!("{} unavailable while resolving {}", cmdlet, address);
                    unavailable.push(cmdlet);
                },
                Err(e) => debug!("{:?} failed for {}: {}", step, address, e),
            }
        }

        match self.legacy_lookup(&local, &address).await? {
            Some(mailbox) => Ok(Some(ResolvedMailbox { mailbox, step: ResolveStep::Legacy })),
            None => Ok(None),
        }
    }

    async fn run_step(&self, step: ResolveStep, local: &str, address: &str) -> Result<Option<Mailbox>, ExchangeError> {
        match step {
            ResolveStep::PrimaryAddress => {
                let found = self.client.query_mailboxes("Get-EXOMailbox", params(json!({"Identity": address}))).await?;
                Ok(found.into_iter().next())
            },
            ResolveStep::RecipientAddress => {
                let found = self.recipients(&format!("PrimarySmtpAddress -eq '{}'", quote(address)), None).await?;
                Ok(lowest_address(found.into_iter().filter(Mailbox::is_mailbox).collect()))
            },
            ResolveStep::ProxyAddress => {
                let found = self.recipients(&format!("EmailAddresses -eq 'smtp:{}'", quote(address)), None).await?;
                Ok(lowest_address(found.into_iter().filter(Mailbox::is_mailbox).collect()))
            },
            ResolveStep::LocalPartWildcard => {
                let found = self.recipients(&wildcard_filter(local), None).await?;
                let mut candidates: Vec<Mailbox> = found.into_iter()
                    .filter(|m| m.is_mailbox() && carries_local_part(m, local))
                    .collect();
                if candidates.len() == 1 {
                    Ok(candidates.pop())
                } else {
                    if candidates.len() > 1 {
                        debug!("{} mailboxes carry local part {}, narrowing by type", candidates.len(), local);
                    }
                    Ok(None)
                }
            },
            ResolveStep::RecipientType => {
                for recipient_type in RECIPIENT_TYPES {
                    let found = self.recipients(&wildcard_filter(local), Some(recipient_type)).await?;
                    let candidates: Vec<Mailbox> = found.into_iter()
                        .filter(|m| carries_local_part(m, local))
                        .collect();
                    if !candidates.is_empty() {
                        return Ok(lowest_address(candidates));
                    }
                }
                Ok(None)
            },
            ResolveStep::Legacy => self.legacy_lookup(local, address).await,
        }
    }

    async fn recipients(&self, filter: &str, recipient_type: Option<&str>) -> Result<Vec<Mailbox>, ExchangeError> {
        let mut parameters = params(json!({"Filter": filter, "ResultSize": "Unlimited"}));
        if let Some(recipient_type) = recipient_type {
            parameters.insert("RecipientTypeDetails".to_string(), json!(recipient_type));
        }
        self.client.query_mailboxes("Get-EXORecipient", parameters).await
    }

    /// `Get-Mailbox` by address, then by alias.
    async fn legacy_lookup(&self, local: &str, address: &str) -> Result<Option<Mailbox>, ExchangeError> {
        for identity in [address, local] {
            match self.client.query_mailboxes("Get-Mailbox", params(json!({"Identity": identity}))).await {
                Ok(found) => {
                    if let Some(mailbox) = found.into_iter().next() {
                        return Ok(Some(mailbox));
                    }
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("Get-Mailbox {} failed: {}", identity, e),
            }
        }
        Ok(None)
    }
}

fn quote(value: &str) -> String {
    value.replace('\'', "''")
}

fn wildcard_filter(local: &str) -> String {
    format!("EmailAddresses -like 'smtp:{}@*'", quote(local))
}

fn carries_local_part(mailbox: &Mailbox, local: &str) -> bool {
    mailbox.local_part() == local
        || mailbox.email_addresses.iter().any(|a| {
            let address = a.to_lowercase();
            address.strip_prefix("smtp:")
                .and_then(|a| a.split('@').next())
                .is_some_and(|l| l == local)
        })
}

fn lowest_address(mut candidates: Vec<Mailbox>) -> Option<Mailbox> {
    candidates.sort_by_key(Mailbox::primary_smtp);
    candidates.into_iter().next()
}
