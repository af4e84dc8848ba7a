//! Access control lists.
//!
//! ACLs are stored denormalized as one JSON blob per bucket/object row and
//! only materialize as XML on the wire. Two input modes exist: a canned ACL
//! via the `x-amz-acl` header, or an explicit `<AccessControlPolicy>` body.

use serde::{Deserialize, Serialize};

use crate::errors::{S3Error, S3ErrorCode};
use crate::xml::{self, XmlWriter};

/// Group URI for all (anonymous and authenticated) users.
pub const ALL_USERS_URI: &str = "http://acs.amazonaws.com/groups/global/AllUsers";
/// Group URI for authenticated users.
pub const AUTHENTICATED_USERS_URI: &str =
    "http://acs.amazonaws.com/groups/global/AuthenticatedUsers";

const VALID_PERMISSIONS: [&str; 5] = ["FULL_CONTROL", "READ", "WRITE", "READ_ACP", "WRITE_ACP"];

/// An access control list: the owning identity plus a list of grants.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Acl {
    #[serde(default)]
    pub owner: AclOwner,
    #[serde(default)]
    pub grants: Vec<AclGrant>,
}

/// The owner portion of an ACL.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AclOwner {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

/// A single grant entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AclGrant {
    pub grantee: AclGrantee,
    pub permission: String,
}

/// Who a grant applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum AclGrantee {
    CanonicalUser {
        id: String,
        #[serde(default)]
        display_name: String,
    },
    Group {
        uri: String,
    },
}

impl Acl {
    /// The `private` ACL: FULL_CONTROL to the owner, nothing else.
    pub fn private(owner_id: &str, owner_display: &str) -> Self {
        Acl {
            owner: AclOwner {
                id: owner_id.to_string(),
                display_name: owner_display.to_string(),
            },
            grants: vec![AclGrant {
                grantee: AclGrantee::CanonicalUser {
                    id: owner_id.to_string(),
                    display_name: owner_display.to_string(),
                },
                permission: "FULL_CONTROL".to_string(),
            }],
        }
    }

    /// Translate a canned ACL name into an explicit grant set.
    pub fn from_canned(canned: &str, owner_id: &str, owner_display: &str) -> Result<Self, S3Error> {
        let mut acl = Acl::private(owner_id, owner_display);
        match canned {
            "private" => {}
            "public-read" => acl.grants.push(AclGrant {
                grantee: AclGrantee::Group {
                    uri: ALL_USERS_URI.to_string(),
                },
                permission: "READ".to_string(),
            }),
            "public-read-write" => {
                for permission in ["READ", "WRITE"] {
                    acl.grants.push(AclGrant {
                        grantee: AclGrantee::Group {
                            uri: ALL_USERS_URI.to_string(),
                        },
                        permission: permission.to_string(),
                    });
                }
            }
            "authenticated-read" => acl.grants.push(AclGrant {
                grantee: AclGrantee::Group {
                    uri: AUTHENTICATED_USERS_URI.to_string(),
                },
                permission: "READ".to_string(),
            }),
            other => {
                return Err(S3Error::with_message(
                    S3ErrorCode::InvalidArgument,
                    format!("invalid canned ACL: {}", other),
                ))
            }
        }
        Ok(acl)
    }

    /// Serialize to the JSON blob stored on the metadata row.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Deserialize the stored JSON blob; a broken blob degrades to empty.
    pub fn from_json(json: &str) -> Self {
        serde_json::from_str(json).unwrap_or_default()
    }

    /// Render as an `AccessControlPolicy` document.
    pub fn to_xml(&self) -> String {
        let mut w = XmlWriter::new();
        w.declaration();
        w.open_with_attrs(
            "AccessControlPolicy",
            &[("xmlns", "http://s3.amazonaws.com/doc/2006-03-01/")],
        );
        w.open("Owner");
        w.element("ID", &self.owner.id);
        w.element("DisplayName", &self.owner.display_name);
        w.close("Owner");
        w.open("AccessControlList");
        for grant in &self.grants {
            w.open("Grant");
            match &grant.grantee {
                AclGrantee::CanonicalUser { id, display_name } => {
                    w.open_with_attrs(
                        "Grantee",
                        &[
                            ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
                            ("xsi:type", "CanonicalUser"),
                        ],
                    );
                    w.element("ID", id);
                    w.element("DisplayName", display_name);
                    w.close("Grantee");
                }
                AclGrantee::Group { uri } => {
                    w.open_with_attrs(
                        "Grantee",
                        &[
                            ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
                            ("xsi:type", "Group"),
                        ],
                    );
                    w.element("URI", uri);
                    w.close("Grantee");
                }
            }
            w.element("Permission", &grant.permission);
            w.close("Grant");
        }
        w.close("AccessControlList");
        w.close("AccessControlPolicy");
        w.finish()
    }
}

/// Parse an `AccessControlPolicy` request body.
pub fn parse_access_control_policy(body: &str) -> Result<Acl, S3Error> {
    if !body.contains("AccessControlPolicy") {
        return Err(S3Error::new(S3ErrorCode::MalformedACLError));
    }
    let owner = xml::extract_tag_blocks(body, "Owner")
        .into_iter()
        .next()
        .map(|block| AclOwner {
            id: xml::extract_tag(&block, "ID").unwrap_or_default(),
            display_name: xml::extract_tag(&block, "DisplayName").unwrap_or_default(),
        })
        .unwrap_or_default();

    let mut grants = Vec::new();
    for block in xml::extract_tag_blocks(body, "Grant") {
        let grantee_block = xml::extract_tag_blocks(&block, "Grantee")
            .into_iter()
            .next()
            .ok_or_else(|| S3Error::new(S3ErrorCode::MalformedACLError))?;
        let grantee = if let Some(uri) = xml::extract_tag(&grantee_block, "URI") {
            AclGrantee::Group { uri }
        } else if let Some(id) = xml::extract_tag(&grantee_block, "ID") {
            AclGrantee::CanonicalUser {
                id,
                display_name: xml::extract_tag(&grantee_block, "DisplayName").unwrap_or_default(),
            }
        } else {
            return Err(S3Error::new(S3ErrorCode::MalformedACLError));
        };
        let permission = xml::extract_tag(&block, "Permission")
            .ok_or_else(|| S3Error::new(S3ErrorCode::MalformedACLError))?;
        if !VALID_PERMISSIONS.contains(&permission.as_str()) {
            return Err(S3Error::new(S3ErrorCode::MalformedACLError));
        }
        grants.push(AclGrant {
            grantee,
            permission,
        });
    }
    Ok(Acl { owner, grants })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canned_translations() {
        let private = Acl::from_canned("private", "owner1", "Owner One").unwrap();
        assert_eq!(private.grants.len(), 1);
        assert_eq!(private.grants[0].permission, "FULL_CONTROL");

        let public = Acl::from_canned("public-read", "owner1", "Owner One").unwrap();
        assert_eq!(public.grants.len(), 2);
        assert!(matches!(
            &public.grants[1].grantee,
            AclGrantee::Group { uri } if uri == ALL_USERS_URI
        ));

        let rw = Acl::from_canned("public-read-write", "owner1", "Owner One").unwrap();
        assert_eq!(rw.grants.len(), 3);

        let auth = Acl::from_canned("authenticated-read", "owner1", "Owner One").unwrap();
        assert!(matches!(
            &auth.grants[1].grantee,
            AclGrantee::Group { uri } if uri == AUTHENTICATED_USERS_URI
        ));

        assert!(Acl::from_canned("bucket-owner-surprise", "o", "o").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let acl = Acl::from_canned("public-read", "owner1", "Owner One").unwrap();
        let json = acl.to_json();
        assert_eq!(Acl::from_json(&json), acl);
        assert_eq!(Acl::from_json("not json"), Acl::default());
    }

    #[test]
    fn test_xml_round_trip() {
        let acl = Acl::from_canned("public-read", "owner1", "Owner One").unwrap();
        let xml = acl.to_xml();
        let parsed = parse_access_control_policy(&xml).unwrap();
        assert_eq!(parsed, acl);
    }

    #[test]
    fn test_parse_rejects_bad_permission() {
        let body = "<AccessControlPolicy><Owner><ID>o</ID></Owner>\
                    <Grant><Grantee><ID>o</ID></Grantee>\
                    <Permission>SUDO</Permission></Grant></AccessControlPolicy>";
        assert!(parse_access_control_policy(body).is_err());
    }

    #[test]
    fn test_parse_rejects_non_acl_document() {
        assert!(parse_access_control_policy("<Delete/>").is_err());
    }
}
