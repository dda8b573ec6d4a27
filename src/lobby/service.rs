//! Lobby service - roster mutations, challenges and match creation

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::game::{GameMatch, MatchCommand, MatchConfig, MatchHandle, MatchId, MatchInput, MatchRegistry};
use crate::util::time::unix_millis;
use crate::ws::hub::ConnectionHub;
use crate::ws::protocol::{ClientMsg, ConnectionId, PlayerInfo, Quat, ServerMsg, Vec3};

use super::roster::{random_lobby_position, LobbyError, PlayerStatus, Roster};

/// Process-wide lobby.
///
/// Every roster mutation happens under one lock and broadcasts the roster
/// before releasing it, so broadcasts go out in mutation order. Matches run
/// as their own tasks and only come back through [`Lobby::finish_match`].
pub struct Lobby {
    roster: Mutex<Roster>,
    hub: Arc<ConnectionHub>,
    registry: Arc<MatchRegistry>,
    match_config: MatchConfig,
}

impl Lobby {
    pub fn new(hub: Arc<ConnectionHub>, registry: Arc<MatchRegistry>, match_config: MatchConfig) -> Self {
        Self {
            roster: Mutex::new(Roster::new()),
            hub,
            registry,
            match_config,
        }
    }

    pub fn players_online(&self) -> usize {
        self.roster.lock().len()
    }

    pub fn active_matches(&self) -> usize {
        self.registry.active_matches()
    }

    pub fn player(&self, id: ConnectionId) -> Option<PlayerInfo> {
        self.roster.lock().get(id).map(|p| p.info())
    }

    /// Register a new connection's outbox and greet it
    pub fn connect(&self, id: ConnectionId) -> tokio::sync::mpsc::Receiver<ServerMsg> {
        let rx = self.hub.register(id);
        self.hub.send(
            id,
            ServerMsg::Welcome {
                connection_id: id,
                server_time: unix_millis(),
            },
        );
        debug!(connection_id = %id, "Connection registered");
        rx
    }

    /// Route one inbound message. Rejections are logged and otherwise
    /// ignored; nothing here fails the connection.
    pub async fn handle_message(self: &Arc<Self>, from: ConnectionId, msg: ClientMsg) {
        let outcome = match msg {
            ClientMsg::Login {
                name,
                link_to_twitter,
            } => self.join(from, name, link_to_twitter).map(|_| ()),
            ClientMsg::Move { position } => self.update_position(from, position),
            ClientMsg::Rotate { quaternion } => self.update_orientation(from, quaternion),
            ClientMsg::Challenge { player_id } => self.challenge(from, player_id),
            ClientMsg::Accept { player_id } => self.accept(from, player_id).map(|_| ()),
            ClientMsg::Fire { x, y } => {
                self.route_to_match(from, MatchCommand::Fire { x, y }).await;
                Ok(())
            }
            ClientMsg::Forfeit => {
                self.route_to_match(from, MatchCommand::Forfeit).await;
                Ok(())
            }
            ClientMsg::Ping { t } => {
                self.hub.send(from, ServerMsg::Pong { t });
                Ok(())
            }
        };

        if let Err(e) = outcome {
            debug!(connection_id = %from, error = %e, "Rejected lobby request");
        }
    }

    fn broadcast_roster(&self, roster: &Roster) {
        self.hub.broadcast(&ServerMsg::UpdatePlayers {
            players: roster.snapshot(),
        });
    }

    /// Add a player for this connection at a random lobby position
    pub fn join(&self, id: ConnectionId, name: String, link_to_twitter: bool) -> Result<PlayerInfo, LobbyError> {
        let position = random_lobby_position(&mut rand::thread_rng());
        let mut roster = self.roster.lock();
        let player = roster.join(id, name, link_to_twitter, position)?;
        self.broadcast_roster(&roster);
        self.hub.send(
            id,
            ServerMsg::InitPlayer {
                player: player.clone(),
            },
        );

        info!(connection_id = %id, name = %player.name, "Player joined lobby");
        Ok(player)
    }

    /// Remove the player, if any, and hand back the match they were in.
    /// Removal and lookup share one lock, so no accept can slip between them.
    fn leave(&self, id: ConnectionId) -> Option<MatchId> {
        let mut roster = self.roster.lock();
        let player = roster.leave(id)?;
        self.broadcast_roster(&roster);
        info!(connection_id = %id, "Player left lobby");
        match player.status {
            PlayerStatus::InMatch(match_id) => Some(match_id),
            PlayerStatus::Idle => None,
        }
    }

    pub fn update_position(&self, id: ConnectionId, position: Vec3) -> Result<(), LobbyError> {
        let mut roster = self.roster.lock();
        roster.move_to(id, position)?;
        self.broadcast_roster(&roster);
        Ok(())
    }

    pub fn update_orientation(&self, id: ConnectionId, rotation: Quat) -> Result<(), LobbyError> {
        let mut roster = self.roster.lock();
        roster.rotate_to(id, rotation)?;
        self.broadcast_roster(&roster);
        Ok(())
    }

    /// Forward a challenge to `to` only. Nothing is stored.
    pub fn challenge(&self, from: ConnectionId, to: ConnectionId) -> Result<(), LobbyError> {
        self.roster.lock().check_pairing(from, to)?;
        self.hub.send(to, ServerMsg::Challenge { attacker: from });
        debug!(attacker = %from, defender = %to, "Challenge forwarded");
        Ok(())
    }

    /// The defender accepts the attacker's challenge: both players move into a
    /// new match that runs on its own task.
    pub fn accept(self: &Arc<Self>, defender: ConnectionId, attacker: ConnectionId) -> Result<MatchId, LobbyError> {
        let seed = rand::random::<u64>();
        let mut roster = self.roster.lock();
        roster.check_pairing(attacker, defender)?;

        let (game_match, handle) =
            GameMatch::new(attacker, defender, &self.match_config, seed, self.hub.clone())?;
        if !self.registry.try_insert(handle.clone()) {
            return Err(LobbyError::AlreadyPlaying(attacker));
        }
        roster.begin_match(attacker, defender, &handle.id)?;
        self.broadcast_roster(&roster);
        drop(roster);

        info!(
            match_id = %handle.id,
            attacker = %attacker,
            defender = %defender,
            seed,
            "Created new match"
        );

        let lobby = Arc::clone(self);
        let match_id = handle.id.clone();
        tokio::spawn(async move {
            let end_state = game_match.run().await;
            debug!(match_id = %handle.id, ?end_state, "Match task finished");
            lobby.finish_match(&handle);
        });

        Ok(match_id)
    }

    /// Completion callback for a match. Only the first call for a given match
    /// releases its players.
    pub fn finish_match(&self, handle: &MatchHandle) -> bool {
        let mut roster = self.roster.lock();
        if self.registry.remove(&handle.id).is_none() {
            return false;
        }
        let released = roster.end_match(&handle.id);
        self.broadcast_roster(&roster);
        info!(match_id = %handle.id, released, "Match removed from registry");
        true
    }

    /// Forward a match-scoped command to the sender's current match
    async fn route_to_match(&self, from: ConnectionId, command: MatchCommand) {
        let match_id = self.roster.lock().match_of(from);
        let Some(match_id) = match_id else {
            debug!(connection_id = %from, ?command, "Not in a match, ignoring");
            return;
        };
        self.send_to_match(&match_id, from, command).await;
    }

    async fn send_to_match(&self, match_id: &MatchId, from: ConnectionId, command: MatchCommand) {
        let Some(handle) = self.registry.get(match_id) else {
            debug!(connection_id = %from, match_id = %match_id, "Match already gone");
            return;
        };
        if handle.input_tx.send(MatchInput { from, command }).await.is_err() {
            debug!(connection_id = %from, match_id = %match_id, "Match already finished");
        }
    }

    /// Connection dropped: remove it from the roster, end the match it was
    /// in and close its outbox
    pub async fn disconnect(&self, id: ConnectionId) {
        if let Some(match_id) = self.leave(id) {
            self.send_to_match(&match_id, id, MatchCommand::Disconnect).await;
        }
        self.hub.unregister(id);
        info!(connection_id = %id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::EndReason;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    struct Client {
        id: ConnectionId,
        rx: Receiver<ServerMsg>,
    }

    impl Client {
        /// Next message matching `pred`, skipping everything else
        async fn expect<F: Fn(&ServerMsg) -> bool>(&mut self, pred: F) -> ServerMsg {
            loop {
                let msg = timeout(Duration::from_secs(5), self.rx.recv())
                    .await
                    .expect("timed out waiting for message")
                    .expect("outbox closed");
                if pred(&msg) {
                    return msg;
                }
            }
        }

        fn drain(&mut self) -> Vec<ServerMsg> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn lobby() -> Arc<Lobby> {
        Arc::new(Lobby::new(
            Arc::new(ConnectionHub::new()),
            Arc::new(MatchRegistry::new()),
            MatchConfig::default(),
        ))
    }

    fn login(lobby: &Lobby, name: &str) -> Client {
        let id = Uuid::new_v4();
        let rx = lobby.connect(id);
        assert_ok!(lobby.join(id, name.to_string(), false));
        Client { id, rx }
    }

    fn is_game_over(msg: &ServerMsg) -> bool {
        matches!(msg, ServerMsg::GameOver { .. })
    }

    async fn wait_until_idle(lobby: &Lobby) {
        timeout(Duration::from_secs(5), async {
            while lobby.active_matches() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("match never finished");
    }

    #[tokio::test]
    async fn join_sends_init_and_broadcasts_roster() {
        let lobby = lobby();
        let mut first = login(&lobby, "nemo");
        let mut second = login(&lobby, "ishmael");

        let msgs = second.drain();
        assert!(matches!(msgs[0], ServerMsg::Welcome { connection_id, .. } if connection_id == second.id));
        let roster = msgs
            .iter()
            .find_map(|m| match m {
                ServerMsg::UpdatePlayers { players } => Some(players.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(roster.len(), 2);
        assert!(msgs.iter().any(|m| matches!(m, ServerMsg::InitPlayer { player } if player.name == "ishmael")));

        // The earlier player sees the newcomer too
        let update = first
            .expect(|m| matches!(m, ServerMsg::UpdatePlayers { players } if players.len() == 2))
            .await;
        assert!(matches!(update, ServerMsg::UpdatePlayers { .. }));

        // Joining twice changes nothing
        assert_err!(lobby.join(second.id, "again".to_string(), true));
        assert_eq!(lobby.player(second.id).unwrap().name, "ishmael");
    }

    #[tokio::test]
    async fn challenge_goes_only_to_target() {
        let lobby = lobby();
        let mut a = login(&lobby, "a");
        let mut b = login(&lobby, "b");
        let mut c = login(&lobby, "c");
        a.drain();
        b.drain();
        c.drain();

        assert_ok!(lobby.challenge(a.id, b.id));
        assert_eq!(b.drain(), vec![ServerMsg::Challenge { attacker: a.id }]);
        assert!(a.drain().is_empty());
        assert!(c.drain().is_empty());

        assert!(lobby.challenge(a.id, Uuid::new_v4()).is_err());
        assert_eq!(lobby.challenge(a.id, a.id), Err(LobbyError::SelfChallenge));
    }

    #[tokio::test]
    async fn busy_players_cannot_be_challenged() {
        let lobby = lobby();
        let a = login(&lobby, "a");
        let b = login(&lobby, "b");
        let mut c = login(&lobby, "c");

        assert_ok!(lobby.accept(b.id, a.id));
        c.drain();
        assert_eq!(lobby.challenge(c.id, a.id), Err(LobbyError::AlreadyPlaying(a.id)));
        assert!(c.drain().is_empty());
    }

    #[tokio::test]
    async fn accept_starts_match_and_marks_players() {
        let lobby = lobby();
        let mut a = login(&lobby, "a");
        let mut b = login(&lobby, "b");

        let match_id = assert_ok!(lobby.accept(b.id, a.id));
        assert_eq!(match_id, crate::game::r#match::match_id(a.id, b.id));
        assert_eq!(lobby.active_matches(), 1);
        assert!(lobby.player(a.id).unwrap().is_playing);
        assert!(lobby.player(b.id).unwrap().is_playing);

        let start = ServerMsg::StartGame {
            attacker: a.id,
            defender: b.id,
        };
        assert_eq!(a.expect(|m| matches!(m, ServerMsg::StartGame { .. })).await, start);
        assert_eq!(b.expect(|m| matches!(m, ServerMsg::StartGame { .. })).await, start);
        a.expect(|m| *m == ServerMsg::YourTurn).await;
        assert!(!b.drain().contains(&ServerMsg::YourTurn));
    }

    #[tokio::test]
    async fn accept_with_missing_player_changes_nothing() {
        let lobby = lobby();
        let a = login(&lobby, "a");
        let ghost = Uuid::new_v4();

        assert_eq!(lobby.accept(a.id, ghost), Err(LobbyError::UnknownPlayer(ghost)));
        assert_eq!(lobby.active_matches(), 0);
        assert!(!lobby.player(a.id).unwrap().is_playing);
    }

    #[tokio::test]
    async fn double_accept_creates_one_match() {
        let lobby = lobby();
        let a = login(&lobby, "a");
        let b = login(&lobby, "b");

        let first = {
            let lobby = lobby.clone();
            let (a, b) = (a.id, b.id);
            tokio::spawn(async move { lobby.accept(b, a) })
        };
        let second = {
            let lobby = lobby.clone();
            let (a, b) = (a.id, b.id);
            tokio::spawn(async move { lobby.accept(a, b) })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(lobby.active_matches(), 1);
    }

    #[tokio::test]
    async fn forfeit_returns_both_players_to_lobby() {
        let lobby = lobby();
        let mut a = login(&lobby, "a");
        let mut b = login(&lobby, "b");
        lobby.accept(b.id, a.id).unwrap();

        b.expect(|m| matches!(m, ServerMsg::InitShips { .. })).await;
        lobby.handle_message(b.id, ClientMsg::Forfeit).await;

        let expected: HashMap<_, _> = [(b.id, EndReason::Forfeit), (a.id, EndReason::Win)].into();
        assert_eq!(a.expect(is_game_over).await, ServerMsg::GameOver { end_state: expected.clone() });
        assert_eq!(b.expect(is_game_over).await, ServerMsg::GameOver { end_state: expected });

        wait_until_idle(&lobby).await;
        assert!(!lobby.player(a.id).unwrap().is_playing);
        assert!(!lobby.player(b.id).unwrap().is_playing);
        a.expect(|m| matches!(m, ServerMsg::UpdatePlayers { players } if players.values().all(|p| !p.is_playing)))
            .await;

        // Further match traffic is ignored
        lobby.handle_message(a.id, ClientMsg::Fire { x: 0, y: 0 }).await;
        assert!(!a.drain().iter().any(|m| matches!(m, ServerMsg::Result(_))));
    }

    #[tokio::test]
    async fn fire_is_routed_and_turn_switches() {
        let lobby = lobby();
        let mut a = login(&lobby, "a");
        let mut b = login(&lobby, "b");
        lobby.accept(b.id, a.id).unwrap();
        a.expect(|m| *m == ServerMsg::YourTurn).await;

        // Out of turn: ignored
        lobby.handle_message(b.id, ClientMsg::Fire { x: 1, y: 1 }).await;
        lobby.handle_message(a.id, ClientMsg::Fire { x: 2, y: 3 }).await;

        let result = a.expect(|m| matches!(m, ServerMsg::Result(_))).await;
        match result {
            ServerMsg::Result(shot) => {
                assert_eq!(shot.fired_by, a.id);
                assert_eq!((shot.x, shot.y), (2, 3));
            }
            other => panic!("unexpected {:?}", other),
        }
        a.expect(|m| *m == ServerMsg::EndTurn).await;
        b.expect(|m| *m == ServerMsg::YourTurn).await;
    }

    #[tokio::test]
    async fn disconnect_mid_match_notifies_opponent_once() {
        let lobby = lobby();
        let a = login(&lobby, "a");
        let mut b = login(&lobby, "b");
        lobby.accept(b.id, a.id).unwrap();
        b.expect(|m| matches!(m, ServerMsg::InitShips { .. })).await;

        // Forfeit and disconnect race on the same match
        lobby.handle_message(a.id, ClientMsg::Forfeit).await;
        lobby.disconnect(a.id).await;

        let over = b.expect(is_game_over).await;
        assert!(matches!(&over, ServerMsg::GameOver { end_state } if end_state[&a.id] == EndReason::Forfeit));

        wait_until_idle(&lobby).await;
        assert!(lobby.player(a.id).is_none());
        assert!(!lobby.player(b.id).unwrap().is_playing);
        assert_eq!(lobby.players_online(), 1);
        assert_eq!(b.drain().iter().filter(|m| is_game_over(m)).count(), 0);
    }

    #[tokio::test]
    async fn disconnect_alone_ends_match_for_both() {
        let lobby = lobby();
        let a = login(&lobby, "a");
        let mut b = login(&lobby, "b");
        lobby.accept(b.id, a.id).unwrap();

        lobby.disconnect(a.id).await;
        let over = b.expect(is_game_over).await;
        match over {
            ServerMsg::GameOver { end_state } => {
                assert_eq!(end_state[&a.id], EndReason::Disconnect);
                assert_eq!(end_state[&b.id], EndReason::Disconnect);
            }
            other => panic!("unexpected {:?}", other),
        }
        wait_until_idle(&lobby).await;
    }

    #[tokio::test]
    async fn leaving_hands_back_the_match_to_end() {
        let lobby = lobby();
        let a = login(&lobby, "a");
        let mut b = login(&lobby, "b");
        let c = login(&lobby, "c");

        assert_eq!(lobby.leave(c.id), None);
        let match_id = lobby.accept(b.id, a.id).unwrap();
        assert_eq!(lobby.leave(a.id), Some(match_id.clone()));
        assert!(lobby.player(b.id).unwrap().is_playing);

        lobby.send_to_match(&match_id, a.id, MatchCommand::Disconnect).await;
        let over = b.expect(is_game_over).await;
        assert!(matches!(&over, ServerMsg::GameOver { end_state } if end_state[&b.id] == EndReason::Disconnect));
        wait_until_idle(&lobby).await;
        assert!(!lobby.player(b.id).unwrap().is_playing);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accept_racing_disconnect_never_strands_the_opponent() {
        for _ in 0..50 {
            let lobby = lobby();
            let a = login(&lobby, "a");
            let b = login(&lobby, "b");

            let accept = {
                let lobby = lobby.clone();
                let (a, b) = (a.id, b.id);
                tokio::spawn(async move { lobby.accept(b, a).is_ok() })
            };
            let gone = {
                let lobby = lobby.clone();
                let a = a.id;
                tokio::spawn(async move { lobby.disconnect(a).await })
            };
            let accepted = accept.await.unwrap();
            gone.await.unwrap();

            wait_until_idle(&lobby).await;
            assert!(lobby.player(a.id).is_none());
            assert!(!lobby.player(b.id).unwrap().is_playing, "accepted: {}", accepted);
            assert_eq!(lobby.players_online(), 1);
        }
    }

    #[tokio::test]
    async fn finish_match_runs_once() {
        let lobby = lobby();
        let a = login(&lobby, "a");
        let b = login(&lobby, "b");
        lobby.accept(b.id, a.id).unwrap();
        let handle = lobby
            .registry
            .get(&crate::game::r#match::match_id(a.id, b.id))
            .unwrap();

        assert!(lobby.finish_match(&handle));
        assert!(!lobby.finish_match(&handle));
        assert!(!lobby.player(a.id).unwrap().is_playing);
    }

    #[tokio::test]
    async fn ping_gets_pong_and_presence_is_broadcast() {
        let lobby = lobby();
        let mut a = login(&lobby, "a");
        let mut b = login(&lobby, "b");
        a.drain();
        b.drain();

        lobby.handle_message(a.id, ClientMsg::Ping { t: 77 }).await;
        assert_eq!(a.drain(), vec![ServerMsg::Pong { t: 77 }]);
        assert!(b.drain().is_empty());

        let position = Vec3 { x: 3.0, y: 0.0, z: 1.0 };
        lobby.handle_message(a.id, ClientMsg::Move { position }).await;
        let update = b.drain();
        assert!(matches!(&update[..], [ServerMsg::UpdatePlayers { players }] if players[&a.id].position == position));

        // Presence from a connection that never logged in is ignored
        let stranger = Uuid::new_v4();
        let _rx = lobby.connect(stranger);
        a.drain();
        lobby
            .handle_message(stranger, ClientMsg::Rotate { quaternion: Quat::IDENTITY })
            .await;
        assert!(a.drain().is_empty());
    }
}
