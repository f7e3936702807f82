//! Placeholder substitution for the PowerShell and bash payloads

/// Replaced with the domain administrator password
pub const PASSWORD_TOKEN: &str = "INPUTPASSWORD";

/// Replaced with the fully qualified directory name
pub const DOMAIN_TOKEN: &str = "DOMAINNAME";

/// Replaced with the NetBIOS name of the domain
pub const NETBIOS_TOKEN: &str = "NETBIOS_NAME";

/// Replaced with the number of gMSA accounts to create
pub const ACCOUNTS_TOKEN: &str = "NUMBER_OF_GMSA_ACCOUNTS";

/// Replaced with the S3 bucket holding artifacts
pub const BUCKET_TOKEN: &str = "BUCKET_NAME";

/// Replaced with the credentials-fetcher RPM file name
pub const RPM_TOKEN: &str = "RPM_FILE";

/// Text written in place of secrets when a payload is logged
pub const REDACTED: &str = "<redacted>";

/// User data for the ECS hosts (Amazon Linux 2023).
///
/// Enables gMSA support in the ECS agent, installs the tooling needed to join the domain,
/// and installs credentials-fetcher from the S3 bucket when the RPM is present (falling back to
/// the distribution package otherwise).
pub const LINUX_USER_DATA: &str = r#"#!/bin/bash
echo "ECS_GMSA_SUPPORTED=true" >> /etc/ecs/ecs.config
dnf install -y dotnet
dnf install -y realmd
dnf install -y oddjob
dnf install -y oddjob-mkhomedir
dnf install -y sssd
dnf install -y adcli
dnf install -y krb5-workstation
dnf install -y samba-common-tools
if aws s3 ls "s3://BUCKET_NAME/RPM_FILE" &> /dev/null; then
    echo "RPM file found in S3 bucket. Transferring to EC2 instance..." >> /tmp/userdata.log
    aws s3 cp s3://BUCKET_NAME/RPM_FILE .
    dnf install -y ./RPM_FILE
    if [ $? -ne 0 ]; then
        echo "RPM file installation failed. Installing credentials-fetcher..." >> /tmp/userdata.log
        dnf install -y credentials-fetcher
    else
        echo "RPM file installation successful." >> /tmp/userdata.log
    fi
else
    echo "RPM file not found in S3 bucket. Installing credentials-fetcher..." >> /tmp/userdata.log
    dnf install -y credentials-fetcher
fi
systemctl enable credentials-fetcher
systemctl start credentials-fetcher
systemctl enable --now --no-block ecs.service
"#;

/// User data for the Windows administration instance (an empty, persisted PowerShell block)
pub const WINDOWS_USER_DATA: &str = "<powershell></powershell><persist>true</persist>";

/// Values substituted into the gMSA PowerShell payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Substitutions {
    pub password: String,
    pub domain_name: String,
    pub netbios_name: String,
    pub accounts: u32,
    pub bucket: String,
}

impl Substitutions {
    /// Token/value pairs in the order they are declared.
    pub fn pairs(&self) -> [(&'static str, String); 5] {
        [
            (PASSWORD_TOKEN, self.password.clone()),
            (DOMAIN_TOKEN, self.domain_name.clone()),
            (NETBIOS_TOKEN, self.netbios_name.clone()),
            (ACCOUNTS_TOKEN, self.accounts.to_string()),
            (BUCKET_TOKEN, self.bucket.clone()),
        ]
    }
}

/// Replaces every occurrence of each token in `template` with its value.
///
/// The template is scanned once from left to right, so substituted values are never scanned
/// again. When several tokens match at the same position, the longest wins. Empty tokens are
/// ignored.
pub fn render<T: AsRef<str>>(template: &str, substitutions: &[(&str, T)]) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let next = substitutions
            .iter()
            .filter(|(token, _)| !token.is_empty())
            .filter_map(|(token, value)| rest.find(token).map(|at| (at, *token, value.as_ref())))
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())));
        let Some((at, token, value)) = next else {
            rendered.push_str(rest);
            return rendered;
        };
        rendered.push_str(&rest[..at]);
        rendered.push_str(value);
        rest = &rest[at + token.len()..];
    }
}

/// Renders the gMSA PowerShell payload.
pub fn gmsa_script(template: &str, substitutions: &Substitutions) -> String {
    render(template, &substitutions.pairs())
}

/// Renders ECS host user data, registering the host with `cluster`.
pub fn linux_user_data(bucket: &str, rpm_file: &str, cluster: &str) -> String {
    let mut script = render(
        LINUX_USER_DATA,
        &[(BUCKET_TOKEN, bucket), (RPM_TOKEN, rpm_file)],
    );
    script.push_str(&format!("echo ECS_CLUSTER={cluster} >> /etc/ecs/ecs.config\n"));
    script
}

/// Derives the NetBIOS name from a fully qualified domain (its first label).
pub fn netbios_name(domain: &str) -> &str {
    domain.split('.').next().unwrap_or(domain)
}

/// Replaces every occurrence of `secret` in `text` so it can be logged.
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, REDACTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TOKENS: [&str; 5] = [
        PASSWORD_TOKEN,
        DOMAIN_TOKEN,
        NETBIOS_TOKEN,
        ACCOUNTS_TOKEN,
        BUCKET_TOKEN,
    ];

    fn values() -> Substitutions {
        Substitutions {
            password: "P@ssw0rd!".into(),
            domain_name: "contoso.com".into(),
            netbios_name: "contoso".into(),
            accounts: 12,
            bucket: "gmsa-plugin-bucket".into(),
        }
    }

    #[test]
    fn test_render_replaces_every_occurrence() {
        let template = "$pw = 'INPUTPASSWORD'\n\
            New-ADOrganizationalUnit -Path 'DC=NETBIOS_NAME' -Server DOMAINNAME\n\
            1..NUMBER_OF_GMSA_ACCOUNTS | % { Write-S3Object -BucketName BUCKET_NAME }\n\
            Test-Connection DOMAINNAME; $cred = 'INPUTPASSWORD'";
        let rendered = gmsa_script(template, &values());
        assert_eq!(
            rendered,
            "$pw = 'P@ssw0rd!'\n\
            New-ADOrganizationalUnit -Path 'DC=contoso' -Server contoso.com\n\
            1..12 | % { Write-S3Object -BucketName gmsa-plugin-bucket }\n\
            Test-Connection contoso.com; $cred = 'P@ssw0rd!'"
        );
        for token in ALL_TOKENS {
            assert!(!rendered.contains(token), "{token} left in script");
        }
    }

    #[test]
    fn test_render_does_not_rescan_values() {
        let mut values = values();
        values.password = "DOMAINNAME".into();
        let rendered = gmsa_script("INPUTPASSWORD@DOMAINNAME", &values);
        assert_eq!(rendered, "DOMAINNAME@contoso.com");
    }

    #[test]
    fn test_render_prefers_longest_token() {
        let rendered = render("RPM_FILE_NAME", &[("RPM_FILE", "a"), ("RPM_FILE_NAME", "b")]);
        assert_eq!(rendered, "b");
    }

    #[test]
    fn test_render_adjacent_and_absent_tokens() {
        assert_eq!(
            render("BUCKET_NAMEBUCKET_NAME", &[(BUCKET_TOKEN, "x")]),
            "xx"
        );
        assert_eq!(render("no tokens here", &[(BUCKET_TOKEN, "x")]), "no tokens here");
        assert_eq!(render("", &[(BUCKET_TOKEN, "x")]), "");
    }

    #[test]
    fn test_render_ignores_empty_token() {
        assert_eq!(render("abc", &[("", "x")]), "abc");
    }

    #[test]
    fn test_linux_user_data() {
        let script = linux_user_data("bucket", "cf.rpm", "my-cluster");
        assert!(script.contains("aws s3 cp s3://bucket/cf.rpm ."));
        assert!(script.contains("dnf install -y ./cf.rpm"));
        assert!(!script.contains(BUCKET_TOKEN));
        assert!(!script.contains(RPM_TOKEN));
        assert!(script.ends_with("echo ECS_CLUSTER=my-cluster >> /etc/ecs/ecs.config\n"));
    }

    #[test]
    fn test_netbios_name() {
        assert_eq!(netbios_name("contoso.example.com"), "contoso");
        assert_eq!(netbios_name("contoso"), "contoso");
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("pw=abc;again=abc", "abc"), "pw=<redacted>;again=<redacted>");
        assert_eq!(redact("unchanged", ""), "unchanged");
    }
}
