//! IRC numeric replies and their default wire formats
//!
//! Each reply code carries a template rendered by the send engine's
//! formatter; `%s`/`%d` take the caller's arguments in order, `%C` renders
//! an entity name in the recipient's dialect, `%H` a channel name.

/// Flag bit: the caller supplies the format string explicitly instead of
/// using the table entry; the low bits still select the on-wire code.
pub const SND_EXPLICIT: u32 = 0x4000_0000;

/// A reply selector: a three-digit code, optionally tagged [`SND_EXPLICIT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Numeric(pub u32);

impl Numeric {
    pub fn code(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn is_explicit(self) -> bool {
        self.0 & SND_EXPLICIT != 0
    }

    pub fn explicit(self) -> Numeric {
        Numeric(self.0 | SND_EXPLICIT)
    }
}

pub const RPL_WELCOME: Numeric = Numeric(1);
pub const RPL_YOURHOST: Numeric = Numeric(2);
pub const RPL_CREATED: Numeric = Numeric(3);
pub const RPL_MYINFO: Numeric = Numeric(4);
pub const RPL_ISUPPORT: Numeric = Numeric(5);
pub const RPL_UMODEIS: Numeric = Numeric(221);
pub const RPL_STATSDEBUG: Numeric = Numeric(249);
pub const RPL_WHOISUSER: Numeric = Numeric(311);
pub const RPL_WHOISSERVER: Numeric = Numeric(312);
pub const RPL_WHOWASUSER: Numeric = Numeric(314);
pub const RPL_ENDOFWHOWAS: Numeric = Numeric(369);
pub const RPL_NOTOPIC: Numeric = Numeric(331);
pub const RPL_TOPIC: Numeric = Numeric(332);
pub const RPL_NAMREPLY: Numeric = Numeric(353);
pub const RPL_ENDOFNAMES: Numeric = Numeric(366);
pub const RPL_MOTDSTART: Numeric = Numeric(375);
pub const RPL_MOTD: Numeric = Numeric(372);
pub const RPL_ENDOFMOTD: Numeric = Numeric(376);
pub const RPL_YOUREOPER: Numeric = Numeric(381);
pub const RPL_REHASHING: Numeric = Numeric(382);
pub const ERR_NOSUCHNICK: Numeric = Numeric(401);
pub const ERR_NOSUCHSERVER: Numeric = Numeric(402);
pub const ERR_NOSUCHCHANNEL: Numeric = Numeric(403);
pub const ERR_CANNOTSENDTOCHAN: Numeric = Numeric(404);
pub const ERR_WASNOSUCHNICK: Numeric = Numeric(406);
pub const ERR_UNKNOWNCOMMAND: Numeric = Numeric(421);
pub const ERR_NOMOTD: Numeric = Numeric(422);
pub const ERR_NONICKNAMEGIVEN: Numeric = Numeric(431);
pub const ERR_ERRONEUSNICKNAME: Numeric = Numeric(432);
pub const ERR_NICKNAMEINUSE: Numeric = Numeric(433);
pub const ERR_NICKCOLLISION: Numeric = Numeric(436);
pub const ERR_NOTONCHANNEL: Numeric = Numeric(442);
pub const ERR_NICKTOOFAST: Numeric = Numeric(438);
pub const ERR_TARGETTOOFAST: Numeric = Numeric(439);
pub const ERR_SERVICESDOWN: Numeric = Numeric(440);
pub const ERR_NOTREGISTERED: Numeric = Numeric(451);
pub const ERR_NEEDMOREPARAMS: Numeric = Numeric(461);
pub const ERR_ALREADYREGISTRED: Numeric = Numeric(462);
pub const ERR_PASSWDMISMATCH: Numeric = Numeric(464);
pub const ERR_YOUREBANNEDCREEP: Numeric = Numeric(465);
pub const ERR_CHANOPRIVSNEEDED: Numeric = Numeric(482);
pub const ERR_NOOPERHOST: Numeric = Numeric(491);
pub const ERR_NOPRIVILEGES: Numeric = Numeric(481);
pub const ERR_BADCHANNAME: Numeric = Numeric(479);

/// Default template for a reply code, or None for codes only ever used
/// with an explicit caller-supplied format.
pub fn template(code: u16) -> Option<&'static str> {
    Some(match code {
        1 => ":Welcome to the Internet Relay Network %s",
        2 => ":Your host is %s, running version %s",
        3 => ":This server was created %s",
        4 => "%s %s %s %s",
        5 => "%s :are supported by this server",
        221 => "%s",
        249 => "%s :%s",
        311 => "%C %s %s * :%s",
        312 => "%C %s :%s",
        314 => "%s %s %s * :%s",
        369 => "%s :End of WHOWAS",
        331 => "%H :No topic is set",
        332 => "%H :%s",
        353 => "= %H :%s",
        366 => "%H :End of NAMES list",
        375 => ":- %s Message of the Day -",
        372 => ":- %s",
        376 => ":End of MOTD command",
        381 => ":You are now an IRC operator",
        382 => "%s :Rehashing",
        401 => "%s :No such nick",
        402 => "%s :No such server",
        403 => "%H :No such channel",
        404 => "%H :Cannot send to channel",
        406 => "%s :There was no such nickname",
        421 => "%s :Unknown command",
        422 => ":MOTD File is missing",
        431 => ":No nickname given",
        432 => "%s :Erroneous nickname",
        433 => "%s :Nickname is already in use",
        436 => "%s :Nickname collision KILL",
        438 => "%s :Nick change too fast. Please wait %d seconds",
        439 => "%s :Target change too fast. Please wait %d seconds",
        440 => "%s :Services are currently unavailable",
        442 => "%H :You're not on that channel",
        451 => ":You have not registered",
        461 => "%s :Not enough parameters",
        462 => ":You may not reregister",
        464 => ":Password incorrect",
        465 => ":You are banned from this server: %s",
        479 => "%H :Illegal channel name",
        481 => ":Permission Denied - You do not have the correct IRC operator privileges",
        482 => "%H :You're not a channel operator",
        491 => ":No Operator block for your host",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_flag() {
        let n = RPL_STATSDEBUG.explicit();
        assert!(n.is_explicit());
        assert_eq!(n.code(), 249);
        assert!(!RPL_STATSDEBUG.is_explicit());
    }

    #[test]
    fn test_known_templates() {
        assert!(template(RPL_WELCOME.code()).is_some());
        assert!(template(ERR_NICKNAMEINUSE.code()).is_some());
        assert!(template(999).is_none());
    }
}
